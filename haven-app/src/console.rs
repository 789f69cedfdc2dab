//! Line-oriented console commands and event rendering for the headless host.

use anyhow::{anyhow, bail, Context};
use haven_core::{EngineEvent, EngineSnapshot, LocationCategory, Position, RankedLocation};

pub const HELP: &str = "\
commands:
  activate | panic          open a session and start the countdown
  confirm                   dispatch now
  cancel                    abort the countdown
  reset                     close a completed session
  state                     print the current snapshot
  say <text>                feed a spoken phrase to the trigger listener
  trigger <word>            simulate a trigger word
  listen on|off             attach or detach the console transcript source
  pos <lat> <lng>           report a position fix
  locations [category]      list safe locations (police, hospital, safe_space)
  contacts                  list emergency contacts
  test <n>                  send a test alert to contact number n
  help                      show this text
  quit | exit               shut down";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Activate,
    Confirm,
    Cancel,
    Reset,
    State,
    Say(String),
    Trigger(String),
    Listen(bool),
    Position(Position),
    Locations(Option<LocationCategory>),
    Contacts,
    /// One-based contact index.
    TestAlert(usize),
    Help,
    Quit,
}

impl ConsoleCommand {
    /// `Ok(None)` for blank lines.
    pub fn parse(line: &str) -> anyhow::Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "activate" | "panic" => Self::Activate,
            "confirm" => Self::Confirm,
            "cancel" => Self::Cancel,
            "reset" => Self::Reset,
            "state" | "status" => Self::State,
            "say" | "hear" => {
                if rest.is_empty() {
                    bail!("usage: say <text>");
                }
                Self::Say(rest.to_string())
            }
            "trigger" => {
                if rest.is_empty() {
                    bail!("usage: trigger <word>");
                }
                Self::Trigger(rest.to_string())
            }
            "listen" => match rest.to_ascii_lowercase().as_str() {
                "on" | "" => Self::Listen(true),
                "off" => Self::Listen(false),
                other => bail!("listen expects on|off, got {other:?}"),
            },
            "pos" | "position" => Self::Position(parse_position(rest)?),
            "locations" | "loc" => {
                if rest.is_empty() {
                    Self::Locations(None)
                } else {
                    Self::Locations(Some(rest.parse().map_err(|e: String| anyhow!(e))?))
                }
            }
            "contacts" => Self::Contacts,
            "test" => {
                let n: usize = rest
                    .parse()
                    .with_context(|| format!("usage: test <n>, got {rest:?}"))?;
                if n == 0 {
                    bail!("contacts are numbered from 1");
                }
                Self::TestAlert(n)
            }
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command {other:?} (try `help`)"),
        };
        Ok(Some(command))
    }
}

fn parse_position(rest: &str) -> anyhow::Result<Position> {
    let mut parts = rest
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|p| !p.is_empty());
    let (Some(lat), Some(lng), None) = (parts.next(), parts.next(), parts.next()) else {
        bail!("usage: pos <lat> <lng>");
    };
    let lat: f64 = lat.parse().with_context(|| format!("bad latitude {lat:?}"))?;
    let lng: f64 = lng.parse().with_context(|| format!("bad longitude {lng:?}"))?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
        bail!("coordinates out of range: {lat}, {lng}");
    }
    Ok(Position::new(lat, lng))
}

pub fn render_snapshot(snapshot: &EngineSnapshot) -> String {
    match &snapshot.session {
        None => format!("state: {}", snapshot.state),
        Some(session) => {
            let channels = session
                .channel_status
                .iter()
                .map(|(channel, status)| format!("{channel}={status:?}"))
                .collect::<Vec<_>>()
                .join(" ");
            let position = session
                .position
                .map(|p| p.display_coords())
                .unwrap_or_else(|| "unknown".into());
            format!(
                "state: {} | session {} | countdown {}s | position {} | {}",
                snapshot.state,
                session.id,
                session.countdown_remaining_seconds,
                position,
                if channels.is_empty() { "-".into() } else { channels }
            )
        }
    }
}

pub fn render_event(event: &EngineEvent) -> String {
    match event {
        EngineEvent::StateChanged { snapshot } => format!("» {}", render_snapshot(snapshot)),
        EngineEvent::CountdownTick { remaining, .. } => {
            format!("» dispatching in {remaining}s (type `cancel` to abort)")
        }
        EngineEvent::TriggerDetected { word, language, matched_text } => {
            format!("» heard trigger word {word:?} [{language}] in {matched_text:?}")
        }
        EngineEvent::ChannelUpdate {
            channel,
            status,
            attempts,
            error,
            ..
        } => match error {
            Some(error) => format!("» {channel}: {status:?} after {attempts} attempt(s): {error}"),
            None => format!("» {channel}: {status:?} after {attempts} attempt(s)"),
        },
        EngineEvent::DispatchCompleted { sent, failed, .. } => format!(
            "» dispatch complete: {} sent, {} failed (type `reset` when safe)",
            sent.len(),
            failed.len()
        ),
        EngineEvent::CapabilityError { kind, detail } => format!("! {kind:?}: {detail}"),
        EngineEvent::LocationsUpdated { dynamic_count } => {
            format!("» {dynamic_count} nearby places found")
        }
        EngineEvent::Ignored { command, state } => format!("· {command} ignored while {state}"),
    }
}

pub fn render_location(index: usize, ranked: &RankedLocation) -> String {
    let loc = &ranked.location;
    let distance = ranked
        .distance_km
        .map(|d| format!("{d:.2} km"))
        .unwrap_or_else(|| "? km".into());
    let mut line = format!(
        "{index:>2}. {} [{}{}] {distance}\n    {} | {}",
        loc.name,
        loc.category,
        if loc.verified { ", verified" } else { "" },
        loc.address,
        loc.directions_url()
    );
    if let Some(tel) = loc.dial_uri() {
        line.push_str(&format!(" | {tel}"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_core::SessionState;

    #[test]
    fn parses_simple_verbs_case_insensitively() {
        assert_eq!(ConsoleCommand::parse("PANIC").unwrap(), Some(ConsoleCommand::Activate));
        assert_eq!(ConsoleCommand::parse(" cancel ").unwrap(), Some(ConsoleCommand::Cancel));
        assert_eq!(ConsoleCommand::parse("").unwrap(), None);
    }

    #[test]
    fn say_keeps_the_rest_of_the_line() {
        assert_eq!(
            ConsoleCommand::parse("say Tuma msaada sasa").unwrap(),
            Some(ConsoleCommand::Say("Tuma msaada sasa".into()))
        );
        assert!(ConsoleCommand::parse("say").is_err());
    }

    #[test]
    fn position_accepts_comma_or_space() {
        let expected = Some(ConsoleCommand::Position(Position::new(-1.2647, 36.7156)));
        assert_eq!(ConsoleCommand::parse("pos -1.2647 36.7156").unwrap(), expected);
        assert_eq!(ConsoleCommand::parse("pos -1.2647, 36.7156").unwrap(), expected);
        assert!(ConsoleCommand::parse("pos 91 0").is_err());
        assert!(ConsoleCommand::parse("pos 1").is_err());
    }

    #[test]
    fn locations_take_optional_category() {
        assert_eq!(
            ConsoleCommand::parse("locations").unwrap(),
            Some(ConsoleCommand::Locations(None))
        );
        assert_eq!(
            ConsoleCommand::parse("locations shelter").unwrap(),
            Some(ConsoleCommand::Locations(Some(LocationCategory::SafeSpace)))
        );
        assert!(ConsoleCommand::parse("locations pizza").is_err());
    }

    #[test]
    fn test_alert_index_is_one_based() {
        assert_eq!(
            ConsoleCommand::parse("test 2").unwrap(),
            Some(ConsoleCommand::TestAlert(2))
        );
        assert!(ConsoleCommand::parse("test 0").is_err());
        assert!(ConsoleCommand::parse("test x").is_err());
    }

    #[test]
    fn listen_toggles() {
        assert_eq!(
            ConsoleCommand::parse("listen off").unwrap(),
            Some(ConsoleCommand::Listen(false))
        );
        assert!(ConsoleCommand::parse("listen maybe").is_err());
    }

    #[test]
    fn unknown_verb_is_an_error() {
        assert!(ConsoleCommand::parse("dance").is_err());
    }

    #[test]
    fn idle_snapshot_renders_state_only() {
        assert_eq!(render_snapshot(&EngineSnapshot::idle()), "state: idle");
        let event = EngineEvent::Ignored {
            command: "cancel".into(),
            state: SessionState::Idle,
        };
        assert_eq!(render_event(&event), "· cancel ignored while idle");
    }
}
