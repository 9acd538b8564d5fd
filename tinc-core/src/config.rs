//! Layered key/value configuration store.
//!
//! The format is line oriented: one `Key = Value` (or `Key Value`) per
//! line, `#` comments, blank lines ignored. Keys are case-insensitive and
//! may occur multiple times; values keep their original spelling. Blocks
//! bracketed by `-----BEGIN` / `-----END` marker lines are skipped
//! verbatim so host files can embed credential blobs.

use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// One configuration line, with its origin for error reporting.
#[derive(Debug, Clone)]
pub struct ConfigEntry {
    pub variable: String,
    pub value: String,
    pub file: String,
    pub line: u32,
}

impl ConfigEntry {
    fn bad(&self, expected: &str) -> Error {
        Error::config(format!(
            "{} expected for configuration variable {} in {} line {}",
            expected, self.variable, self.file, self.line
        ))
    }

    /// `yes` / `no`, case-insensitive.
    pub fn as_bool(&self) -> Result<bool> {
        if self.value.eq_ignore_ascii_case("yes") {
            Ok(true)
        } else if self.value.eq_ignore_ascii_case("no") {
            Ok(false)
        } else {
            Err(self.bad("\"yes\" or \"no\""))
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        self.value.parse().map_err(|_| self.bad("integer"))
    }

    /// A label out of `choices`, matched case-insensitively.
    pub fn as_choice<T: Copy>(&self, choices: &[(&str, T)]) -> Result<T> {
        choices
            .iter()
            .find(|(label, _)| self.value.eq_ignore_ascii_case(label))
            .map(|&(_, v)| v)
            .ok_or_else(|| self.bad("valid choice"))
    }

    /// A time period: `<int>` with an optional unit suffix out of
    /// `s m h d W M Y`. A bare integer counts seconds.
    pub fn as_period(&self) -> Result<Duration> {
        let v = self.value.trim();
        let (digits, unit) = match v.find(|c: char| !c.is_ascii_digit()) {
            Some(pos) => v.split_at(pos),
            None => (v, ""),
        };
        let n: u64 = digits.parse().map_err(|_| self.bad("period"))?;
        let secs = match unit {
            "" | "s" => n,
            "m" => n * 60,
            "h" => n * 60 * 60,
            "d" => n * 60 * 60 * 24,
            "W" => n * 60 * 60 * 24 * 7,
            "M" => n * 60 * 60 * 24 * 30,
            "Y" => n * 60 * 60 * 24 * 365,
            _ => return Err(self.bad("period")),
        };
        Ok(Duration::from_secs(secs))
    }
}

/// An insertion-ordered multi-map of configuration entries.
#[derive(Debug, Default)]
pub struct Config {
    entries: Vec<ConfigEntry>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read and append one configuration file.
    pub fn read_file(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot open {}: {e}", path.display()))
        })?;
        self.parse(&text, &path.display().to_string())
    }

    /// Parse configuration text; `file` is used in error messages only.
    pub fn parse(&mut self, text: &str, file: &str) -> Result<()> {
        let mut ignore = false;

        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx as u32 + 1;
            let line = raw.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if ignore {
                if line.starts_with("-----END") {
                    ignore = false;
                }
                continue;
            }
            if line.starts_with("-----BEGIN") {
                ignore = true;
                continue;
            }

            let split = line
                .find(|c: char| c == '=' || c.is_ascii_whitespace())
                .unwrap_or(line.len());
            let variable = &line[..split];
            let mut value = line[split..].trim_start();
            if let Some(rest) = value.strip_prefix('=') {
                value = rest.trim_start();
            }

            if value.is_empty() {
                return Err(Error::config(format!(
                    "no value for variable {variable} on line {lineno} in {file}"
                )));
            }

            self.entries.push(ConfigEntry {
                variable: variable.to_owned(),
                value: value.to_owned(),
                file: file.to_owned(),
                line: lineno,
            });
        }

        Ok(())
    }

    /// First entry for `key`, in insertion order.
    pub fn first<'a>(&'a self, key: &'a str) -> Option<&'a ConfigEntry> {
        self.iter(key).next()
    }

    /// All entries for `key`, in insertion order.
    pub fn iter<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a ConfigEntry> {
        self.entries
            .iter()
            .filter(move |e| e.variable.eq_ignore_ascii_case(key))
    }

    pub fn get_string(&self, key: &str, default: Option<&str>) -> Option<String> {
        self.first(key)
            .map(|e| e.value.clone())
            .or_else(|| default.map(str::to_owned))
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        self.first(key).map_or(Ok(default), ConfigEntry::as_bool)
    }

    pub fn get_int(&self, key: &str, default: i64) -> Result<i64> {
        self.first(key).map_or(Ok(default), ConfigEntry::as_int)
    }

    pub fn get_period(&self, key: &str, default: Duration) -> Result<Duration> {
        self.first(key).map_or(Ok(default), ConfigEntry::as_period)
    }

    pub fn get_choice<T: Copy>(&self, key: &str, choices: &[(&str, T)], default: T) -> Result<T> {
        self.first(key)
            .map_or(Ok(default), |e| e.as_choice(choices))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parsed(text: &str) -> Config {
        let mut cfg = Config::new();
        cfg.parse(text, "test.conf").unwrap();
        cfg
    }

    #[test]
    fn basic_lines_and_comments() {
        let cfg = parsed("# leading comment\nName = alpha\n\nPort 655\nMode=Switch\n");
        assert_eq!(cfg.get_string("name", None).as_deref(), Some("alpha"));
        assert_eq!(cfg.get_string("PORT", None).as_deref(), Some("655"));
        assert_eq!(cfg.get_string("Mode", None).as_deref(), Some("Switch"));
    }

    #[test]
    fn repeated_keys_keep_insertion_order() {
        let cfg = parsed("ConnectTo = beta\nConnectTo = gamma\nConnectTo = delta\n");
        let all: Vec<_> = cfg.iter("connectto").map(|e| e.value.as_str()).collect();
        assert_eq!(all, ["beta", "gamma", "delta"]);
        assert_eq!(cfg.first("ConnectTo").unwrap().value, "beta");
    }

    #[test]
    fn credential_blocks_are_skipped() {
        let cfg = parsed(
            "Address = 10.0.0.1\n\
             -----BEGIN CERTIFICATE-----\n\
             Zm9vYmFyIGJhego=\n\
             -----END CERTIFICATE-----\n\
             Port = 655\n",
        );
        assert_eq!(cfg.len(), 2);
        assert_eq!(cfg.get_string("Port", None).as_deref(), Some("655"));
    }

    #[test]
    fn coercions() {
        let cfg = parsed(
            "TunnelServer = yes\nHostnames = no\nWeight = 42\n\
             MACExpire = 10m\nPingTimeout = 60\nMaxTimeout = 1h\n",
        );
        assert!(cfg.get_bool("tunnelserver", false).unwrap());
        assert!(!cfg.get_bool("hostnames", true).unwrap());
        assert_eq!(cfg.get_int("weight", 0).unwrap(), 42);
        assert_eq!(
            cfg.get_period("macexpire", Duration::ZERO).unwrap(),
            Duration::from_secs(600)
        );
        assert_eq!(
            cfg.get_period("pingtimeout", Duration::ZERO).unwrap(),
            Duration::from_secs(60)
        );
        assert_eq!(
            cfg.get_period("maxtimeout", Duration::ZERO).unwrap(),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn bad_values_are_errors() {
        let cfg = parsed("TunnelServer = maybe\nWeight = heavy\nMACExpire = 5x\n");
        assert!(cfg.get_bool("tunnelserver", false).is_err());
        assert!(cfg.get_int("weight", 0).is_err());
        assert!(cfg.get_period("macexpire", Duration::ZERO).is_err());
        // Defaults still apply for absent keys.
        assert!(cfg.get_bool("absent", true).unwrap());
    }

    #[test]
    fn missing_value_is_a_parse_error() {
        let mut cfg = Config::new();
        assert!(cfg.parse("Name =\n", "broken.conf").is_err());
    }

    #[test]
    fn choice_is_case_insensitive() {
        let cfg = parsed("Mode = sWiTcH\n");
        let mode = cfg
            .get_choice("Mode", &[("Router", 0), ("Switch", 1), ("Hub", 2)], 0)
            .unwrap();
        assert_eq!(mode, 1);
    }

    #[test]
    fn reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Name = omega").unwrap();
        let mut cfg = Config::new();
        cfg.read_file(file.path()).unwrap();
        assert_eq!(cfg.get_string("Name", None).as_deref(), Some("omega"));
    }
}
