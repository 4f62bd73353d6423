// src/options.rs - Scan option set and argument mapping
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ScanError, ScanResult};
use crate::target::Target;

static PORT_SPEC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{1,5}(-\d{1,5})?(,\d{1,5}(-\d{1,5})?)*$").unwrap()
});

/// Check an nmap-style port spec: a comma list of ports and dash ranges,
/// every port in 1-65535. Shared with the target resolver for `:ports`
/// suffixes.
pub(crate) fn validate_port_spec(spec: &str) -> Result<(), String> {
    if !PORT_SPEC_RE.is_match(spec) {
        return Err(format!("invalid port range '{}'", spec));
    }
    for number in spec.split(|c| c == ',' || c == '-') {
        let port: u32 = number
            .parse()
            .map_err(|_| format!("invalid port '{}'", number))?;
        if port == 0 || port > 65535 {
            return Err(format!("port {} out of range", port));
        }
    }
    Ok(())
}

/// Recognized scan styles. A closed set; anything else is rejected at
/// submission time rather than at process launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    Quick,
    Full,
    Stealth,
    Udp,
    Custom,
}

/// Nmap timing templates, -T0 through -T5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingProfile {
    Paranoid,
    Sneaky,
    Polite,
    Normal,
    Aggressive,
    Insane,
}

impl TimingProfile {
    fn flag(self) -> &'static str {
        match self {
            TimingProfile::Paranoid => "-T0",
            TimingProfile::Sneaky => "-T1",
            TimingProfile::Polite => "-T2",
            TimingProfile::Normal => "-T3",
            TimingProfile::Aggressive => "-T4",
            TimingProfile::Insane => "-T5",
        }
    }
}

/// Fixed option set for one scan job. Immutable once the job is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOptions {
    pub scan_type: ScanType,
    /// Port spec in nmap form ("22", "1-1024", "22,80,443") or "all".
    pub port_range: String,
    pub timing: TimingProfile,
    /// Extra script selection for Custom scans, e.g. "--script vuln".
    pub script_args: Option<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            scan_type: ScanType::Quick,
            port_range: "all".to_string(),
            timing: TimingProfile::Aggressive,
            script_args: None,
        }
    }
}

impl ScanOptions {
    pub fn new(scan_type: ScanType) -> Self {
        Self {
            scan_type,
            ..Self::default()
        }
    }

    /// Validate the option set. Called at submission; a job is never created
    /// from options that fail here.
    pub fn validate(&self) -> ScanResult<()> {
        if self.port_range != "all" {
            validate_port_spec(&self.port_range).map_err(ScanError::InvalidTargetSpec)?;
        }
        if self.scan_type == ScanType::Custom && self.script_args.is_none() {
            return Err(ScanError::InvalidTargetSpec(
                "custom scans require script_args".to_string(),
            ));
        }
        Ok(())
    }

    /// Map the option set to an nmap argument vector for one target.
    ///
    /// Verbose stats output is always requested so the output stream carries
    /// parsable progress lines. A port restriction on the target itself
    /// overrides the option-level port range.
    pub fn to_args(&self, target: &Target) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-v".to_string(),
            "--stats-every".to_string(),
            "1s".to_string(),
            self.timing.flag().to_string(),
        ];

        match self.scan_type {
            ScanType::Quick => args.push("-F".to_string()),
            ScanType::Full => {
                args.push("-p-".to_string());
                args.push("-sV".to_string());
            }
            ScanType::Stealth => args.push("-sS".to_string()),
            ScanType::Udp => args.push("-sU".to_string()),
            ScanType::Custom => {}
        }

        if let Some(script_args) = &self.script_args {
            args.extend(script_args.split_whitespace().map(str::to_string));
        }

        let ports = target.ports.as_deref().unwrap_or(&self.port_range);
        // Quick and Full already pin a port selection unless the target
        // narrows it explicitly.
        let default_ports_apply = matches!(self.scan_type, ScanType::Quick | ScanType::Full);
        if target.ports.is_some() || (!default_ports_apply && ports != "all") {
            args.push("-p".to_string());
            args.push(if ports == "all" { "-".to_string() } else { ports.to_string() });
        }

        args.push(target.host.clone());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quick_scan_maps_to_fast_flags() {
        let args = ScanOptions::default().to_args(&Target::new("10.0.0.1"));
        assert_eq!(args, vec!["-v", "--stats-every", "1s", "-T4", "-F", "10.0.0.1"]);
    }

    #[test]
    fn target_port_restriction_overrides_option_range() {
        let options = ScanOptions {
            port_range: "1-1024".to_string(),
            ..ScanOptions::new(ScanType::Stealth)
        };
        let args = options.to_args(&Target::with_ports("10.0.0.1", "443"));
        assert!(args.windows(2).any(|w| w == ["-p", "443"]));
    }

    #[test]
    fn custom_scan_requires_script_args() {
        let options = ScanOptions::new(ScanType::Custom);
        assert!(options.validate().is_err());

        let options = ScanOptions {
            script_args: Some("--script vuln".to_string()),
            ..options
        };
        options.validate().unwrap();
        let args = options.to_args(&Target::new("10.0.0.1"));
        assert!(args.windows(2).any(|w| w == ["--script", "vuln"]));
    }

    #[test]
    fn port_spec_validator_checks_grammar_and_bounds() {
        validate_port_spec("22,8000-8080").unwrap();
        for bad in ["0", "70000", "22-", "80;443"] {
            assert!(validate_port_spec(bad).is_err(), "'{}' should be rejected", bad);
        }
    }

    #[test]
    fn port_range_grammar_is_checked() {
        let mut options = ScanOptions::default();
        for bad in ["80;443", "0", "70000", "22-", "a-b"] {
            options.port_range = bad.to_string();
            assert!(options.validate().is_err(), "'{}' should be rejected", bad);
        }
        for good in ["all", "22", "1-1024", "22,80,443", "22,8000-8080"] {
            options.port_range = good.to_string();
            options.validate().unwrap();
        }
    }
}
