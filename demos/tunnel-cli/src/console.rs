//! Operator console: stdin commands and terminal rendering.

use support_tunnel_core::{
    protocol::{Action, ActionKind},
    terminal::{LineLevel, LineSource, TerminalLine},
};

/// One line of operator input.
#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Text(String),
    Action(Action),
    Baud(u32),
    Signal { dtr: bool, rts: bool },
    End,
    Invalid(String),
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Self {
        let Some(command) = line.strip_prefix('/') else {
            return Self::Text(format!("{line}\r\n"));
        };
        let mut words = command.split_whitespace();
        match (words.next(), words.next()) {
            (Some("reset"), None) => Self::Action(Action::new(ActionKind::Reset)),
            (Some("boot"), None) => Self::Action(Action::new(ActionKind::Bootloader)),
            (Some("flash"), Some(url)) => Self::Action(Action::flash(url)),
            (Some("abort"), None) => Self::Action(Action::new(ActionKind::FlashAbort)),
            (Some("baud"), Some(rate)) => rate
                .parse()
                .map_or_else(|_| Self::Invalid(format!("bad baud rate: {rate}")), Self::Baud),
            (Some("signal"), Some(bits)) => match bits.as_bytes() {
                [dtr @ (b'0' | b'1'), rts @ (b'0' | b'1')] => Self::Signal {
                    dtr: *dtr == b'1',
                    rts: *rts == b'1',
                },
                _ => Self::Invalid(format!("expected two bits, got {bits}")),
            },
            (Some("end"), None) => Self::End,
            _ => Self::Invalid(format!(
                "unknown command /{command}; try /reset /boot /flash <url> /abort /baud <rate> /signal <dtr><rts> /end"
            )),
        }
    }
}

pub fn render(line: &TerminalLine) -> String {
    match (line.source, line.level) {
        (LineSource::Device, _) => line.text.trim_end_matches(['\r', '\n']).to_string(),
        (LineSource::Admin, _) => format!("> {}", line.text.trim_end()),
        (LineSource::System, Some(LineLevel::Error)) => format!("[error] {}", line.text),
        (LineSource::System, Some(LineLevel::Warn)) => format!("[warn] {}", line.text),
        (LineSource::System, _) => format!("[info] {}", line.text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_lines_are_typed_with_crlf() {
        assert_eq!(
            ConsoleCommand::parse("help"),
            ConsoleCommand::Text("help\r\n".into())
        );
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            ConsoleCommand::parse("/flash https://fw.example/m.json"),
            ConsoleCommand::Action(Action::flash("https://fw.example/m.json"))
        );
        assert_eq!(ConsoleCommand::parse("/baud 921600"), ConsoleCommand::Baud(921_600));
        assert_eq!(
            ConsoleCommand::parse("/signal 10"),
            ConsoleCommand::Signal {
                dtr: true,
                rts: false
            }
        );
        assert_eq!(ConsoleCommand::parse("/end"), ConsoleCommand::End);
        assert!(matches!(ConsoleCommand::parse("/baud fast"), ConsoleCommand::Invalid(_)));
        assert!(matches!(ConsoleCommand::parse("/flash"), ConsoleCommand::Invalid(_)));
        assert!(matches!(ConsoleCommand::parse("/reset now"), ConsoleCommand::Invalid(_)));
    }

    #[test]
    fn test_render_prefixes_system_lines() {
        let line = TerminalLine::system(LineLevel::Warn, "Bridge degraded (was healthy)");
        assert_eq!(render(&line), "[warn] Bridge degraded (was healthy)");
        assert_eq!(render(&TerminalLine::device("ok\r\n")), "ok");
    }
}
