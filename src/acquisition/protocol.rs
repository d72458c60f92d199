//! Command table and response helpers for the spectrometer server.

use super::settings::{AcquisitionConfig, Apodization, Gain};
use crate::channel::{Command, ACK_TOKEN};
use std::str::FromStr;

/// Identity query.
pub fn identify() -> Command {
    Command::trusted("*IDN?".to_string())
}

/// Initialization status query; the server reports `0` once ready.
pub fn init_status() -> Command {
    Command::trusted("STAT:INIT?".to_string())
}

/// Start an acquisition.
pub fn begin_acquisition() -> Command {
    Command::trusted("SPEC:GET?".to_string())
}

/// Number of measurements still to be taken.
pub fn measurements_remaining() -> Command {
    Command::trusted("MEAS:REM?".to_string())
}

/// Detector saturation of the last measurement.
pub fn saturation() -> Command {
    Command::trusted("SPEC:SAT?".to_string())
}

/// Transfer the completed spectrum.
pub fn fetch_spectrum() -> Command {
    Command::trusted("TRAN:SPEC?".to_string())
}

/// Select the detector gain.
pub fn gain_select(gain: Gain) -> Command {
    Command::trusted(format!("GAIN:SET {}", gain.index()))
}

/// Select the apodization function.
pub fn apodization_select(apodization: Apodization) -> Command {
    Command::trusted(format!("SPEC:APO {}", apodization.index()))
}

/// Number of spectra to average.
pub fn spectrum_averages(count: u32) -> Command {
    Command::trusted(format!("SPEC:AVG {}", count))
}

/// Number of interferograms to average.
pub fn interferogram_averages(count: u32) -> Command {
    Command::trusted(format!("IFGM:AVG {}", count))
}

/// The configuration commands for `config`, in the order the server expects.
///
/// Transfer format (ASCII, absolute scale, wavelength axis) comes first, then
/// gain, apodization and averaging.
pub fn configuration_commands(config: &AcquisitionConfig) -> Vec<Command> {
    let mut commands = vec![
        Command::trusted("TRAN:LEN 1".to_string()),
        Command::trusted("TRAN:BIN 0".to_string()),
        Command::trusted("TRAN:SABS 1".to_string()),
        Command::trusted("SPEC:WLG 1".to_string()),
        gain_select(config.gain),
        apodization_select(config.apodization),
        spectrum_averages(config.average_count.get()),
    ];
    if config.interferogram_averaging {
        commands.push(interferogram_averages(config.average_count.get()));
    }
    commands
}

/// Whether a `STAT:INIT?` response reports initialization as complete.
///
/// Ready means some line ends in the token `0`. Echoes, blank lines and the
/// acknowledgement line are ignored.
pub fn status_reports_ready(text: &str) -> bool {
    text.lines()
        .filter_map(|line| line.split_whitespace().last())
        .any(|token| token == "0")
}

/// Extract the numeric value reported two lines below the acknowledgement.
///
/// Query replies put `OK` on one line and the value on the second line after
/// it. The value line is stripped of everything except digits, `.`, `e`, `E`,
/// `+` and `-` before parsing.
pub fn extract_value_after_ok<T: FromStr>(text: &str) -> Option<T> {
    let lines: Vec<&str> = text.lines().collect();
    let ack = lines.iter().position(|line| line.contains(ACK_TOKEN))?;
    let value_line = lines.get(ack + 2)?;

    let cleaned: String = value_line
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
        .collect();
    cleaned.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;

    fn lines(commands: &[Command]) -> Vec<&str> {
        commands.iter().map(Command::as_str).collect()
    }

    #[test]
    fn test_configuration_order() {
        let config = AcquisitionConfig {
            gain: Gain::High,
            apodization: Apodization::Hann,
            average_count: NonZeroU32::new(8).unwrap(),
            interferogram_averaging: false,
        };
        assert_eq!(
            lines(&configuration_commands(&config)),
            vec![
                "TRAN:LEN 1",
                "TRAN:BIN 0",
                "TRAN:SABS 1",
                "SPEC:WLG 1",
                "GAIN:SET 2",
                "SPEC:APO 8",
                "SPEC:AVG 8",
            ]
        );
    }

    #[test]
    fn test_interferogram_averaging_appended_last() {
        let config = AcquisitionConfig {
            interferogram_averaging: true,
            ..AcquisitionConfig::default()
        };
        let commands = configuration_commands(&config);
        assert_eq!(commands.len(), 8);
        assert_eq!(commands[7].as_str(), "IFGM:AVG 5");
    }

    #[test]
    fn test_extract_value_after_ok() {
        assert_eq!(extract_value_after_ok::<i64>("MEAS:REM?\nOK\n\n3"), Some(3));
        assert_eq!(
            extract_value_after_ok::<f64>("OK\nSPEC:SAT\n 0.42 \n"),
            Some(0.42)
        );
        // Noise around the digits is stripped.
        assert_eq!(extract_value_after_ok::<i64>("OK\n--\n<12>;"), Some(12));
    }

    #[test]
    fn test_extract_value_requires_two_following_lines() {
        assert_eq!(extract_value_after_ok::<i64>("OK\n3"), None);
        assert_eq!(extract_value_after_ok::<i64>(""), None);
        assert_eq!(extract_value_after_ok::<i64>("no ack\n\n4"), None);
        assert_eq!(extract_value_after_ok::<i64>("MEAS:REM?\nOK\n\n7\n"), Some(7));
    }

    #[test]
    fn test_extract_value_unparseable() {
        assert_eq!(extract_value_after_ok::<i64>("OK\n\nbusy"), None);
        assert_eq!(extract_value_after_ok::<i64>("OK\n\n1.5"), None);
    }

    #[test]
    fn test_status_reports_ready() {
        assert!(status_reports_ready("0"));
        assert!(status_reports_ready("STAT:INIT?\nOK\n\n0"));
        assert!(status_reports_ready("STAT:INIT 0"));
        assert!(!status_reports_ready("OK\n\n1"));
        assert!(!status_reports_ready("OK\n\n10"));
        assert!(!status_reports_ready(""));
    }
}
