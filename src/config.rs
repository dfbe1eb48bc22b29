use serde::{Serialize, Deserialize};
use std::time::Duration;

/// Consensus parameters shared by the chain and the notary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shares needed to recover a group signature.
    pub group_threshold: usize,
    /// Notarized descendants required on the fork choice branch before a
    /// fork root is finalized.
    pub finalize_depth: usize,
    /// Finalized blocks kept before the oldest is buried into history.
    pub bury_depth: usize,
    /// Soft deadline: how long the notary collects proposals (ms).
    pub collect_window_ms: u64,
    /// Hard cancel: when the notary stops signing for the round (ms).
    pub round_timeout_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("parsing config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Invalid(#[from] Invalid),
}

/// Parameter combinations `validate` rejects.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Invalid {
    #[error("group threshold must be positive")]
    ZeroThreshold,
    #[error("round timeout {timeout_ms}ms is shorter than the collect window {window_ms}ms")]
    ShortRound { window_ms: u64, timeout_ms: u64 },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            group_threshold: 3,
            finalize_depth: 2,
            bury_depth: 8,
            collect_window_ms: 1_000,
            round_timeout_ms: 4_000,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let cfg: Config = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), Invalid> {
        if self.group_threshold == 0 {
            return Err(Invalid::ZeroThreshold);
        }
        if self.round_timeout_ms < self.collect_window_ms {
            return Err(Invalid::ShortRound {
                window_ms: self.collect_window_ms,
                timeout_ms: self.round_timeout_ms,
            });
        }
        Ok(())
    }

    pub fn collect_window(&self) -> Duration {
        Duration::from_millis(self.collect_window_ms)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn with_group_threshold(mut self, threshold: usize) -> Self {
        self.group_threshold = threshold;
        self
    }

    pub fn with_finalize_depth(mut self, depth: usize) -> Self {
        self.finalize_depth = depth;
        self
    }

    pub fn with_bury_depth(mut self, depth: usize) -> Self {
        self.bury_depth = depth;
        self
    }

    pub fn with_timing(mut self, collect_window_ms: u64, round_timeout_ms: u64) -> Self {
        self.collect_window_ms = collect_window_ms;
        self.round_timeout_ms = round_timeout_ms;
        self
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn partial_json() {
        let cfg = Config::from_json(r#"{ "group_threshold": 5, "bury_depth": 2 }"#).unwrap();
        assert_eq!(cfg.group_threshold, 5);
        assert_eq!(cfg.bury_depth, 2);
        assert_eq!(cfg.finalize_depth, Config::default().finalize_depth);
        assert_eq!(cfg.collect_window(), Duration::from_millis(1_000));
    }

    #[test]
    fn invalid() {
        assert!(matches!(
            Config::from_json(r#"{ "group_threshold": 0 }"#),
            Err(Error::Invalid(Invalid::ZeroThreshold))
        ));
        assert!(matches!(
            Config::from_json(r#"{ "collect_window_ms": 10, "round_timeout_ms": 5 }"#),
            Err(Error::Invalid(Invalid::ShortRound { window_ms: 10, timeout_ms: 5 }))
        ));
        assert!(matches!(Config::from_json("not json"), Err(Error::Parse(_))));
    }

    #[test]
    fn builders() {
        let cfg = Config::default()
            .with_group_threshold(2)
            .with_finalize_depth(1)
            .with_bury_depth(0)
            .with_timing(10, 50);
        assert_eq!(cfg.validate(), Ok(()));
        assert_eq!(cfg.clone().with_group_threshold(0).validate(), Err(Invalid::ZeroThreshold));
        assert_eq!(cfg.round_timeout(), Duration::from_millis(50));
    }
}
