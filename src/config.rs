use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{info, warn};
use serde::Deserialize;
use thiserror::Error;

use crate::filter::PacketFilter;
use crate::packet::Packet;

// ==========================================
// 配置：JSON 里的 profile 列表，按优先级从高到低排
// ==========================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("profile '{profile}': {reason}")]
    Invalid { profile: String, reason: String },
    #[error("duplicate profile id '{0}'")]
    DuplicateId(String),
}

/// 对一个方向的一次性调整：吞吐量增减、强制丢掉接下来若干字节
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LinkEffect {
    pub throughput_kbps_change: i64,
    pub drop_bytes: i64,
}

/// 按累计字节数触发的效果
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VolumeTriggeredEvent {
    pub trigger_at_bytes: u64,
    #[serde(default)]
    pub active_for_bytes: Option<u64>,
    #[serde(default)]
    pub repeat_after_bytes: Option<u64>,
    #[serde(flatten)]
    pub effect: LinkEffect,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkProperties {
    pub throughput_kbps: Option<u64>,
    pub max_queue_bytes: Option<u64>,
    pub drop_bytes: i64,
    pub volume_events: Vec<VolumeTriggeredEvent>,
}

/// 按连接建立后的时间触发的效果 (秒)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimedEvent {
    pub trigger_time: f64,
    pub duration: Option<f64>,
    pub repeat_interval: Option<f64>,
    pub extra_rtt: f64,
    pub downlink: LinkEffect,
    pub uplink: LinkEffect,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub id: String,
    #[serde(default)]
    pub filter: String,
    #[serde(default)]
    pub target_rtt: Option<f64>,
    #[serde(default)]
    pub downlink: Option<LinkProperties>,
    #[serde(default)]
    pub uplink: Option<LinkProperties>,
    #[serde(default)]
    pub timed_events: Vec<TimedEvent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    profiles: Vec<ProfileConfig>,
}

#[derive(Debug)]
pub struct Profile {
    config: ProfileConfig,
    filter: PacketFilter,
}

impl Profile {
    /// 编译过滤器；表达式写错了不算致命，profile 留着但永远匹配不上
    pub fn new(config: ProfileConfig) -> Self {
        let filter = match PacketFilter::compile(&config.filter) {
            Ok(f) => f,
            Err(e) => {
                warn!(
                    "Profile '{}': invalid filter \"{}\" ({}); it will never match",
                    config.id, config.filter, e
                );
                PacketFilter::never()
            }
        };
        Self { config, filter }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn matches(&self, packet: &Packet) -> bool {
        self.filter.matches(packet)
    }

    pub fn target_rtt(&self) -> Option<f64> {
        self.config.target_rtt
    }

    pub fn downlink(&self) -> Option<&LinkProperties> {
        self.config.downlink.as_ref()
    }

    pub fn uplink(&self) -> Option<&LinkProperties> {
        self.config.uplink.as_ref()
    }

    pub fn timed_events(&self) -> &[TimedEvent] {
        &self.config.timed_events
    }
}

#[derive(Debug, Default)]
pub struct Config {
    profiles: Vec<Rc<Profile>>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_str(text)?;
        validate(&file.profiles)?;
        Ok(Self {
            profiles: file
                .profiles
                .into_iter()
                .map(|p| Rc::new(Profile::new(p)))
                .collect(),
        })
    }

    /// 重新读配置。失败时旧的 profile 列表原样保留；
    /// 已经建立的连接手里拿着旧的 `Rc<Profile>`，不受影响。
    pub fn update(&mut self, path: &Path) -> Result<(), ConfigError> {
        let fresh = Self::load(path)?;
        info!("Loaded {} profile(s) from {}", fresh.profiles.len(), path.display());
        *self = fresh;
        Ok(())
    }

    pub fn profiles(&self) -> &[Rc<Profile>] {
        &self.profiles
    }

    /// 按优先级找第一个匹配的 profile
    pub fn find_match(&self, packet: &Packet) -> Option<Rc<Profile>> {
        self.profiles.iter().find(|p| p.matches(packet)).cloned()
    }
}

fn validate(profiles: &[ProfileConfig]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for p in profiles {
        if !seen.insert(p.id.as_str()) {
            return Err(ConfigError::DuplicateId(p.id.clone()));
        }
        let invalid = |reason: String| ConfigError::Invalid {
            profile: p.id.clone(),
            reason,
        };

        if let Some(rtt) = p.target_rtt {
            if !rtt.is_finite() || rtt < 0.0 {
                return Err(invalid(format!("target_rtt must be >= 0, got {rtt}")));
            }
        }
        for (i, e) in p.timed_events.iter().enumerate() {
            if !e.trigger_time.is_finite() || e.trigger_time < 0.0 {
                return Err(invalid(format!("timed_events[{i}].trigger_time must be >= 0")));
            }
            if e.duration.is_some_and(|d| !d.is_finite() || d < 0.0) {
                return Err(invalid(format!("timed_events[{i}].duration must be >= 0")));
            }
            if e.repeat_interval.is_some_and(|r| !r.is_finite() || r <= 0.0) {
                return Err(invalid(format!("timed_events[{i}].repeat_interval must be > 0")));
            }
            // 持续时间不短于周期的话，恢复定时器每轮都被推后，效果永远撤不掉
            if let (Some(d), Some(r)) = (e.duration, e.repeat_interval) {
                if d >= r {
                    return Err(invalid(format!(
                        "timed_events[{i}].duration ({d}) must be shorter than repeat_interval ({r})"
                    )));
                }
            }
            if !e.extra_rtt.is_finite() {
                return Err(invalid(format!("timed_events[{i}].extra_rtt is not a number")));
            }
        }
        for (name, link) in [("downlink", &p.downlink), ("uplink", &p.uplink)] {
            if link.as_ref().is_some_and(|l| l.drop_bytes < 0) {
                return Err(invalid(format!("{name}.drop_bytes must be >= 0")));
            }
        }
    }
    Ok(())
}
