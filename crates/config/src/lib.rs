// SPDX-License-Identifier: Apache-2.0

//! Configuration of the Proxima RMA layer.
//!
//! Two inputs exist: process-wide [`EnvParams`] read once from the
//! environment at startup, and per-window [`WinInfo`] arguments parsed from
//! the info mapping passed to `allocate`. Both are plain data; nothing here
//! touches the runtime.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

pub mod error;

pub use error::Error;

/// Default number of helper processes per node.
pub const DEFAULT_NUM_HELPERS: usize = 1;

/// Default segment unit in bytes (segment-binding granularity).
pub const DEFAULT_SEG_UNIT: usize = 16;

/// Default threshold (percent) for both auto-async hysteresis bounds.
pub const DEFAULT_ASYNC_THRESHOLD: u64 = 50;

/// Environment variable names, all read once at startup.
pub mod env_keys {
    /// Helpers per node.
    pub const NUM_HELPERS: &str = "PROXIMA_NUM_HELPERS";
    /// Segment unit in bytes.
    pub const SEG_UNIT: &str = "PROXIMA_SEG_UNIT";
    /// Lock binding mode.
    pub const LOCK_BINDING: &str = "PROXIMA_LOCK_BINDING";
    /// Load balancing policy.
    pub const LOAD_OPT: &str = "PROXIMA_LOAD_OPT";
    /// Lock granting strategy for load balancing.
    pub const LOAD_LOCK: &str = "PROXIMA_LOAD_LOCK";
    /// Automatic asynchronous-progress scheduling.
    pub const ASYNC_SCHED: &str = "PROXIMA_ASYNC_SCHED";
    /// Upper hysteresis threshold (percent).
    pub const ASYNC_THR_HIGH: &str = "PROXIMA_ASYNC_THR_HIGH";
    /// Lower hysteresis threshold (percent).
    pub const ASYNC_THR_LOW: &str = "PROXIMA_ASYNC_THR_LOW";
}

/// How a main helper is bound to the bytes of a target's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockBinding {
    /// One helper per target rank; a single segment spans the window.
    #[default]
    Rank,
    /// The window is partitioned into byte segments, each owned by a helper.
    Segment,
}

impl FromStr for LockBinding {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rank" => Ok(LockBinding::Rank),
            "segment" => Ok(LockBinding::Segment),
            _ => Err(()),
        }
    }
}

/// Runtime load-balancing policy across a target's helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadOpt {
    /// Always the main helper.
    #[default]
    Static,
    /// Rotate through helpers with a window-level cursor.
    Random,
    /// Pick the helper with the fewest operations.
    OpCounting,
    /// Pick the helper with the fewest accumulated bytes.
    ByteCounting,
}

impl FromStr for LoadOpt {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(LoadOpt::Static),
            "random" => Ok(LoadOpt::Random),
            "op_counting" => Ok(LoadOpt::OpCounting),
            "byte_counting" => Ok(LoadOpt::ByteCounting),
            _ => Err(()),
        }
    }
}

/// How remote locks are granted when load balancing distributes operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadLock {
    /// Wait for a user flush/unlock to confirm the grant.
    #[default]
    Natural,
    /// Force the grant with an explicit flush on the first spread.
    Force,
}

impl FromStr for LoadLock {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "natural" => Ok(LoadLock::Natural),
            "force" => Ok(LoadLock::Force),
            _ => Err(()),
        }
    }
}

/// Process-wide parameters, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvParams {
    /// Helper processes per node.
    pub num_helpers: usize,
    /// Segment unit in bytes; every segment boundary is aligned to it.
    pub seg_unit: usize,
    /// Main-helper binding mode.
    pub lock_binding: LockBinding,
    /// Load balancing policy.
    pub load_opt: LoadOpt,
    /// Lock granting strategy.
    pub load_lock: LoadLock,
    /// Whether the auto-async scheduler is active.
    pub auto_async_sched: bool,
    /// Upper hysteresis threshold in percent: at or above, async turns off.
    pub async_thr_high: u64,
    /// Lower hysteresis threshold in percent: at or below, async turns on.
    pub async_thr_low: u64,
}

impl Default for EnvParams {
    fn default() -> Self {
        Self {
            num_helpers: DEFAULT_NUM_HELPERS,
            seg_unit: DEFAULT_SEG_UNIT,
            lock_binding: LockBinding::default(),
            load_opt: LoadOpt::default(),
            load_lock: LoadLock::default(),
            auto_async_sched: false,
            async_thr_high: DEFAULT_ASYNC_THRESHOLD,
            async_thr_low: DEFAULT_ASYNC_THRESHOLD,
        }
    }
}

impl EnvParams {
    /// Reads parameters from the process environment.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_vars(std::env::vars())
    }

    /// Reads parameters from an explicit variable set (tests, harnesses).
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut params = Self::default();
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                env_keys::NUM_HELPERS => {
                    params.num_helpers = parse_positive(key, value)?;
                }
                env_keys::SEG_UNIT => {
                    params.seg_unit = parse_positive(key, value)?;
                }
                env_keys::LOCK_BINDING => {
                    params.lock_binding = value.parse().map_err(|()| Error::InvalidValue {
                        key: key.to_string(),
                        value: value.to_string(),
                        expected: "`rank` or `segment`",
                    })?;
                }
                env_keys::LOAD_OPT => {
                    params.load_opt = value.parse().map_err(|()| Error::InvalidValue {
                        key: key.to_string(),
                        value: value.to_string(),
                        expected: "`static`, `random`, `op_counting` or `byte_counting`",
                    })?;
                }
                env_keys::LOAD_LOCK => {
                    params.load_lock = value.parse().map_err(|()| Error::InvalidValue {
                        key: key.to_string(),
                        value: value.to_string(),
                        expected: "`natural` or `force`",
                    })?;
                }
                env_keys::ASYNC_SCHED => {
                    params.auto_async_sched = match value {
                        "on" => true,
                        "off" => false,
                        _ => {
                            return Err(Error::InvalidValue {
                                key: key.to_string(),
                                value: value.to_string(),
                                expected: "`on` or `off`",
                            });
                        }
                    };
                }
                env_keys::ASYNC_THR_HIGH => {
                    params.async_thr_high = parse_number(key, value)?;
                }
                env_keys::ASYNC_THR_LOW => {
                    params.async_thr_low = parse_number(key, value)?;
                }
                _ => {}
            }
        }
        Ok(params)
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64, Error> {
    value.parse().map_err(|_| Error::InvalidNumber {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_positive(key: &str, value: &str) -> Result<usize, Error> {
    let n: usize = value.parse().map_err(|_| Error::InvalidNumber {
        key: key.to_string(),
        value: value.to_string(),
    })?;
    if n == 0 {
        return Err(Error::MustBePositive {
            key: key.to_string(),
        });
    }
    Ok(n)
}

bitflags::bitflags! {
    /// Epoch types a window promises to use, as advertised through the
    /// `epoch_type` info key. Governs which underlying windows are created.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EpochType: u32 {
        /// `lock_all` epochs.
        const LOCK_ALL = 1;
        /// Per-target `lock` epochs.
        const LOCK = 2;
        /// Post-start-complete-wait epochs.
        const PSCW = 4;
        /// Fence epochs.
        const FENCE = 8;
    }
}

impl Default for EpochType {
    fn default() -> Self {
        EpochType::all()
    }
}

/// Whether asynchronous redirection is enabled for a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AsyncMode {
    /// Redirection off; `allocate` returns a plain window.
    Disabled,
    /// On unless the auto scheduler decided off.
    #[default]
    Auto,
    /// Always on, overriding the scheduler.
    ForceOn,
}

/// Info arguments recognized by `allocate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WinInfo {
    /// `enable_async`: redirection mode.
    pub enable_async: AsyncMode,
    /// `no_local_load_store`: permits skipping the local-lock forcing
    /// optimization.
    pub no_local_load_store: bool,
    /// `epoch_type`: epochs the caller promises to use.
    pub epoch_type: EpochType,
}

/// Info mapping passed to `allocate`.
pub type Info = HashMap<String, String>;

impl WinInfo {
    /// Parses the recognized keys of an info mapping; unrecognized keys are
    /// ignored.
    pub fn parse(info: &Info) -> Result<Self, Error> {
        let mut args = Self::default();

        if let Some(value) = info.get("enable_async") {
            args.enable_async = match value.as_str() {
                "false" => AsyncMode::Disabled,
                "true" => AsyncMode::ForceOn,
                _ => {
                    return Err(Error::InvalidValue {
                        key: "enable_async".to_string(),
                        value: value.clone(),
                        expected: "`true` or `false`",
                    });
                }
            };
            // Async off: none of the remaining keys matter.
            if args.enable_async == AsyncMode::Disabled {
                return Ok(args);
            }
        }

        if let Some(value) = info.get("no_local_load_store") {
            args.no_local_load_store = match value.as_str() {
                "true" => true,
                "false" => false,
                _ => {
                    return Err(Error::InvalidValue {
                        key: "no_local_load_store".to_string(),
                        value: value.clone(),
                        expected: "`true` or `false`",
                    });
                }
            };
        }

        if let Some(value) = info.get("epoch_type") {
            let mut mask = EpochType::empty();
            for token in value.split('|').filter(|t| !t.is_empty()) {
                mask |= match token {
                    "lockall" => EpochType::LOCK_ALL,
                    "lock" => EpochType::LOCK,
                    "pscw" => EpochType::PSCW,
                    "fence" => EpochType::FENCE,
                    _ => {
                        return Err(Error::UnknownEpochType {
                            token: token.to_string(),
                            value: value.clone(),
                        });
                    }
                };
            }
            if !mask.is_empty() {
                args.epoch_type = mask;
            }
        }

        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let params = EnvParams::from_vars(std::iter::empty::<(&str, &str)>()).expect("parse");
        assert_eq!(params, EnvParams::default());
        assert_eq!(params.num_helpers, 1);
        assert_eq!(params.seg_unit, 16);
        assert!(!params.auto_async_sched);
    }

    #[test]
    fn full_environment() {
        let params = EnvParams::from_vars([
            (env_keys::NUM_HELPERS, "2"),
            (env_keys::SEG_UNIT, "64"),
            (env_keys::LOCK_BINDING, "segment"),
            (env_keys::LOAD_OPT, "byte_counting"),
            (env_keys::LOAD_LOCK, "force"),
            (env_keys::ASYNC_SCHED, "on"),
            (env_keys::ASYNC_THR_HIGH, "90"),
            (env_keys::ASYNC_THR_LOW, "10"),
        ])
        .expect("parse");
        assert_eq!(params.num_helpers, 2);
        assert_eq!(params.seg_unit, 64);
        assert_eq!(params.lock_binding, LockBinding::Segment);
        assert_eq!(params.load_opt, LoadOpt::ByteCounting);
        assert_eq!(params.load_lock, LoadLock::Force);
        assert!(params.auto_async_sched);
        assert_eq!(params.async_thr_high, 90);
        assert_eq!(params.async_thr_low, 10);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            EnvParams::from_vars([(env_keys::LOCK_BINDING, "node")]),
            Err(Error::InvalidValue { .. })
        ));
        assert!(matches!(
            EnvParams::from_vars([(env_keys::NUM_HELPERS, "0")]),
            Err(Error::MustBePositive { .. })
        ));
        assert!(matches!(
            EnvParams::from_vars([(env_keys::SEG_UNIT, "lots")]),
            Err(Error::InvalidNumber { .. })
        ));
    }

    #[test]
    fn env_params_serde_roundtrip() {
        let params = EnvParams {
            lock_binding: LockBinding::Segment,
            load_opt: LoadOpt::OpCounting,
            ..EnvParams::default()
        };
        let json = serde_json::to_string(&params).expect("serialize");
        let back: EnvParams = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, params);
    }

    #[test]
    fn win_info_defaults_to_everything_on() {
        let info = Info::new();
        let args = WinInfo::parse(&info).expect("parse");
        assert_eq!(args.enable_async, AsyncMode::Auto);
        assert!(!args.no_local_load_store);
        assert_eq!(args.epoch_type, EpochType::all());
    }

    #[test]
    fn win_info_epoch_subset() {
        let mut info = Info::new();
        let _ = info.insert("epoch_type".to_string(), "lock|pscw".to_string());
        let args = WinInfo::parse(&info).expect("parse");
        assert_eq!(args.epoch_type, EpochType::LOCK | EpochType::PSCW);
    }

    #[test]
    fn win_info_async_off_short_circuits() {
        let mut info = Info::new();
        let _ = info.insert("enable_async".to_string(), "false".to_string());
        let _ = info.insert("epoch_type".to_string(), "garbage".to_string());
        let args = WinInfo::parse(&info).expect("parse");
        assert_eq!(args.enable_async, AsyncMode::Disabled);
    }

    #[test]
    fn win_info_rejects_unknown_epoch_token() {
        let mut info = Info::new();
        let _ = info.insert("epoch_type".to_string(), "lock|nope".to_string());
        assert!(matches!(
            WinInfo::parse(&info),
            Err(Error::UnknownEpochType { .. })
        ));
    }
}
