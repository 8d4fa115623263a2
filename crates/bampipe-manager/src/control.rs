use std::fmt::Write;

use bampipe_backend::BamType;

use crate::error::{BamError, Result};

/// Usage text returned for `help`.
pub const TIMER_USAGE: &str = "Usage: <bam_name> <ms>,<bam_name> <ms>,...\n\
    \tbam_name: [ssusb, hsusb, hsic]\n\
    \tms: time in ms. Use 0 to disable timer\n";

/// A parsed write to the timer control surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerCommand {
    Help,
    Set(Vec<(BamType, u32)>),
}

/// Outcome of applying a [`TimerCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerUpdate {
    /// `help` was requested; nothing changed.
    Usage(&'static str),
    /// Settings applied, in input order.
    Applied(Vec<(BamType, u32)>),
}

/// Parse a control string. Every pair is validated before anything is
/// returned, so a bad pair rejects the whole input.
pub fn parse_timer_command(input: &str) -> Result<TimerCommand> {
    if input.contains("help") {
        return Ok(TimerCommand::Help);
    }

    let mut settings = Vec::new();
    for pair in input.trim().split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let mut fields = pair.split_whitespace();
        let (Some(name), Some(ms), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(BamError::InvalidArgument(format!(
                "expected '<bam_name> <ms>', got '{pair}'"
            )));
        };
        let bam =
            BamType::from_core_name(name).ok_or_else(|| BamError::UnknownInstance(name.into()))?;
        let ms = ms.parse::<u32>().map_err(|err| {
            BamError::InvalidArgument(format!("invalid duration '{ms}' for {name}: {err}"))
        })?;
        settings.push((bam, ms));
    }

    if settings.is_empty() {
        return Err(BamError::InvalidArgument(
            "no timer settings given".to_string(),
        ));
    }
    Ok(TimerCommand::Set(settings))
}

/// Render the timer table, one line per instance.
pub fn format_timers(timers: &[(BamType, u32)]) -> String {
    let mut out = String::new();
    for (bam, ms) in timers {
        let _ = writeln!(out, "{bam}: {ms}ms");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pairs_in_order() {
        let cmd = parse_timer_command("hsusb 100, hsic 0\n").unwrap();
        assert_eq!(
            cmd,
            TimerCommand::Set(vec![(BamType::Hsusb, 100), (BamType::Hsic, 0)])
        );
    }

    #[test]
    fn help_wins_over_everything_else() {
        assert_eq!(parse_timer_command("help").unwrap(), TimerCommand::Help);
        assert_eq!(parse_timer_command("hsusb 5,help").unwrap(), TimerCommand::Help);
    }

    #[test]
    fn core_names_resolve_like_the_table() {
        let cmd = parse_timer_command("dwc3 250").unwrap();
        assert_eq!(cmd, TimerCommand::Set(vec![(BamType::Ssusb, 250)]));
    }

    #[test]
    fn unknown_instance_rejects_whole_input() {
        assert!(matches!(
            parse_timer_command("hsusb 100,ufs 5"),
            Err(BamError::UnknownInstance(name)) if name == "ufs"
        ));
    }

    #[test]
    fn malformed_pairs_are_rejected() {
        assert!(matches!(
            parse_timer_command("hsusb"),
            Err(BamError::InvalidArgument(_))
        ));
        assert!(matches!(
            parse_timer_command("hsusb ten"),
            Err(BamError::InvalidArgument(_))
        ));
        assert!(matches!(
            parse_timer_command("hsusb 1 2"),
            Err(BamError::InvalidArgument(_))
        ));
        assert!(matches!(
            parse_timer_command(" , "),
            Err(BamError::InvalidArgument(_))
        ));
    }

    #[test]
    fn renders_one_line_per_instance() {
        let text = format_timers(&[
            (BamType::Ssusb, 0),
            (BamType::Hsusb, 100),
            (BamType::Hsic, 0),
        ]);
        assert_eq!(text, "ssusb: 0ms\nhsusb: 100ms\nhsic: 0ms\n");
    }
}
