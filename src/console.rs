//! Operator commands read from stdin by the binary

use std::fmt;

pub const HELP: &str = "commands: start | stop | broker <host[:port]> | status | history | ports | help | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Start,
    Stop,
    Broker(String),
    Status,
    History,
    Ports,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl fmt::Display for UnknownCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown command '{}' ({})", self.0, HELP)
    }
}

impl ConsoleCommand {
    /// `None` for blank input
    pub fn parse(input: &str) -> Option<Result<Self, UnknownCommand>> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }

        let (word, rest) = match input.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (input, ""),
        };

        let command = match (word.to_lowercase().as_str(), rest) {
            ("start", "") => ConsoleCommand::Start,
            ("stop", "") => ConsoleCommand::Stop,
            ("broker", address) if !address.is_empty() => {
                ConsoleCommand::Broker(address.to_string())
            }
            ("status", "") => ConsoleCommand::Status,
            ("history", "") => ConsoleCommand::History,
            ("ports", "") => ConsoleCommand::Ports,
            ("help", "") | ("?", "") => ConsoleCommand::Help,
            ("quit", "") | ("exit", "") => ConsoleCommand::Quit,
            _ => return Some(Err(UnknownCommand(input.to_string()))),
        };
        Some(Ok(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_commands_case_insensitively() {
        assert_eq!(ConsoleCommand::parse(" START "), Some(Ok(ConsoleCommand::Start)));
        assert_eq!(ConsoleCommand::parse("stop"), Some(Ok(ConsoleCommand::Stop)));
        assert_eq!(ConsoleCommand::parse("exit"), Some(Ok(ConsoleCommand::Quit)));
    }

    #[test]
    fn broker_takes_an_address() {
        assert_eq!(
            ConsoleCommand::parse("broker  10.0.0.2:1884 "),
            Some(Ok(ConsoleCommand::Broker("10.0.0.2:1884".to_string())))
        );
        assert!(matches!(ConsoleCommand::parse("broker"), Some(Err(_))));
    }

    #[test]
    fn blank_and_unknown_input() {
        assert_eq!(ConsoleCommand::parse("   "), None);
        let err = ConsoleCommand::parse("start now").unwrap().unwrap_err();
        assert!(err.to_string().starts_with("unknown command 'start now'"));
    }
}
