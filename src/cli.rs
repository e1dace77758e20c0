//! Command-line interface and REPL

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use hapticlink::driver::OutputType;

/// Operator command entered at the prompt
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Play(String),
    Stop { effect: String, fadeout: f32 },
    State(String),
    Boost { device: String, value: Option<i32> },
    Status,
    Scan(OutputType),
    Pause,
    Resume,
    StopAll,
    Patterns,
    Help,
    Quit,
}

pub const HELP: &str = "\
  play <effect>              start an effect
  stop <effect> [fadeout]    stop all instances (fadeout in seconds)
  state <effect>             show the effect state
  boost <device> [0-100]     show or set the global boost
  status                     connection status of every device
  scan [output]              scan for devices (autodetect, bluetooth, usb, wifi)
  pause | resume | stopall   global playback control
  patterns                   list loaded patterns per device
  quit                       disconnect and exit";

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err("empty command".to_string());
        };
        let args: Vec<&str> = words.collect();

        let effect_arg = |args: &[&str]| -> Result<String, String> {
            args.first()
                .map(|s| s.to_string())
                .ok_or_else(|| format!("usage: {} <effect>", verb))
        };

        match verb.to_ascii_lowercase().as_str() {
            "play" | "p" => Ok(Command::Play(effect_arg(&args)?)),
            "stop" | "s" => {
                let effect = effect_arg(&args)?;
                let fadeout = match args.get(1) {
                    Some(raw) => raw
                        .parse::<f32>()
                        .map_err(|_| format!("invalid fadeout '{}'", raw))?
                        .max(0.0),
                    None => 0.0,
                };
                Ok(Command::Stop { effect, fadeout })
            }
            "state" => Ok(Command::State(effect_arg(&args)?)),
            "boost" => {
                let device = args
                    .first()
                    .map(|s| s.to_string())
                    .ok_or_else(|| "usage: boost <device> [0-100]".to_string())?;
                let value = match args.get(1) {
                    Some(raw) => Some(
                        raw.parse::<i32>()
                            .map_err(|_| format!("invalid boost '{}'", raw))?,
                    ),
                    None => None,
                };
                Ok(Command::Boost { device, value })
            }
            "status" => Ok(Command::Status),
            "scan" => {
                let output = match args.first() {
                    Some(raw) => raw.parse()?,
                    None => OutputType::Autodetect,
                };
                Ok(Command::Scan(output))
            }
            "pause" => Ok(Command::Pause),
            "resume" => Ok(Command::Resume),
            "stopall" => Ok(Command::StopAll),
            "patterns" => Ok(Command::Patterns),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" | "q" => Ok(Command::Quit),
            other => Err(format!("unknown command '{}' (try 'help')", other)),
        }
    }
}

/// Read commands on a dedicated thread and forward them to the main loop
///
/// End of input (Ctrl-D) and Ctrl-C at the prompt both send `Quit`.
pub fn spawn_repl(tx: mpsc::UnboundedSender<Command>) {
    std::thread::spawn(move || {
        let mut rl = match DefaultEditor::new() {
            Ok(rl) => rl,
            Err(e) => {
                warn!("REPL unavailable: {}", e);
                return;
            }
        };

        loop {
            match rl.readline("haptic> ") {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let _ = rl.add_history_entry(line.as_str());
                    match Command::parse(&line) {
                        Ok(command) => {
                            let quit = command == Command::Quit;
                            if tx.send(command).is_err() || quit {
                                break;
                            }
                        }
                        Err(e) => println!("{}", e),
                    }
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                    let _ = tx.send(Command::Quit);
                    break;
                }
                Err(e) => {
                    warn!("REPL read failed: {}", e);
                    let _ = tx.send(Command::Quit);
                    break;
                }
            }
        }
        debug!("REPL thread exiting");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_effect_commands() {
        assert_eq!(Command::parse("play hit"), Ok(Command::Play("hit".into())));
        assert_eq!(
            Command::parse("stop hit 0.5"),
            Ok(Command::Stop {
                effect: "hit".into(),
                fadeout: 0.5
            })
        );
        assert_eq!(
            Command::parse("  STOP   hit "),
            Ok(Command::Stop {
                effect: "hit".into(),
                fadeout: 0.0
            })
        );
        assert!(Command::parse("play").is_err());
        assert!(Command::parse("stop hit soon").is_err());
    }

    #[test]
    fn test_parse_device_commands() {
        assert_eq!(
            Command::parse("boost vest 40"),
            Ok(Command::Boost {
                device: "vest".into(),
                value: Some(40)
            })
        );
        assert_eq!(
            Command::parse("boost vest"),
            Ok(Command::Boost {
                device: "vest".into(),
                value: None
            })
        );
        assert_eq!(Command::parse("scan usb"), Ok(Command::Scan(OutputType::Usb)));
        assert_eq!(Command::parse("scan"), Ok(Command::Scan(OutputType::Autodetect)));
        assert!(Command::parse("scan serial").is_err());
    }

    #[test]
    fn test_parse_unknown_and_empty() {
        assert!(Command::parse("").is_err());
        assert!(Command::parse("dance").is_err());
        assert_eq!(Command::parse("exit"), Ok(Command::Quit));
    }
}
