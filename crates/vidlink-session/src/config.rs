use std::collections::HashSet;
use std::net::SocketAddr;

use serde::Deserialize;
use uuid::Uuid;

use crate::connection::Endpoint;
use crate::error::ConfigError;
use crate::pipeline::PipelineConfig;
use crate::session::{Role, SessionConfig};
use vidlink_codec::encoder::EncoderConfig;
use vidlink_codec::engine::ProfileLevel;
use vidlink_transport::parser::ParserConfig;

pub const CONFIG_VERSION: u32 = 1;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:7878";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfigInput {
    pub version: u32,
    pub node: NodeSectionInput,
    pub video: VideoConfigInput,
    pub network: NetworkConfigInput,
    pub pipeline: PipelineConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeSectionInput {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VideoConfigInput {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub quality: Option<f32>,
    pub keyframe_interval: Option<u32>,
    pub profile: Option<ProfileLevel>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkConfigInput {
    pub listen: Option<String>,
    pub peers: Vec<PeerConfigInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PeerConfigInput {
    pub name: String,
    pub addr: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfigInput {
    pub channel_capacity: Option<usize>,
    pub max_pending_bytes: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub quality: f32,
    pub keyframe_interval: u32,
    pub profile: ProfileLevel,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            quality: 0.7,
            keyframe_interval: 60,
            profile: ProfileLevel::BaselineAuto,
        }
    }
}

impl VideoConfig {
    /// Check the constraints the encoder relies on. Run again after any
    /// override applied outside [`NodeConfigInput::resolve`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 || self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(invalid(
                "video",
                format!("dimensions must be even and non-zero, got {}x{}", self.width, self.height),
            ));
        }
        if !(1..=240).contains(&self.fps) {
            return Err(invalid("video", format!("fps {} out of range 1..=240", self.fps)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    pub listen: SocketAddr,
    pub peers: Vec<Endpoint>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 7878)),
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub version: u32,
    pub name: String,
    pub video: VideoConfig,
    pub network: NetworkConfig,
    pub pipeline: PipelineConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            name: default_name(),
            video: VideoConfig::default(),
            network: NetworkConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

fn default_name() -> String {
    format!("vidlink-{}", Uuid::now_v7().simple())
}

fn invalid(section: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        section,
        reason: reason.into(),
    }
}

impl NodeConfigInput {
    pub fn resolve(self) -> Result<NodeConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let name = self
            .node
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(default_name);

        let defaults = VideoConfig::default();
        let video = VideoConfig {
            width: self.video.width.unwrap_or(defaults.width),
            height: self.video.height.unwrap_or(defaults.height),
            fps: self.video.fps.unwrap_or(defaults.fps),
            quality: self.video.quality.unwrap_or(defaults.quality).clamp(0.0, 1.0),
            keyframe_interval: self
                .video
                .keyframe_interval
                .unwrap_or(defaults.keyframe_interval)
                .max(1),
            profile: self.video.profile.unwrap_or(defaults.profile),
        };
        video.validate()?;

        let listen = match self.network.listen {
            Some(listen) => listen
                .trim()
                .parse()
                .map_err(|_| invalid("network", format!("bad listen address {listen:?}")))?,
            None => NetworkConfig::default().listen,
        };

        let mut used = HashSet::new();
        let mut peers = Vec::new();
        for peer in self.network.peers {
            let name = peer.name.trim().to_string();
            if name.is_empty() || !used.insert(name.clone()) {
                continue;
            }
            let addr = peer
                .addr
                .trim()
                .parse()
                .map_err(|_| invalid("network", format!("bad address {:?} for peer {name}", peer.addr)))?;
            peers.push(Endpoint::new(name, addr));
        }

        let pipeline_defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            channel_capacity: self
                .pipeline
                .channel_capacity
                .unwrap_or(pipeline_defaults.channel_capacity)
                .max(1),
            parser: ParserConfig {
                max_pending: self
                    .pipeline
                    .max_pending_bytes
                    .unwrap_or(pipeline_defaults.parser.max_pending)
                    .max(1024),
            },
        };

        Ok(NodeConfig {
            version,
            name,
            video,
            network: NetworkConfig { listen, peers },
            pipeline,
        })
    }
}

impl NodeConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(NodeConfig::default());
        }
        let parsed: NodeConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig {
            width: self.video.width,
            height: self.video.height,
            quality: self.video.quality,
            keyframe_interval: self.video.keyframe_interval,
            realtime: true,
            profile: self.video.profile,
            queue_capacity: EncoderConfig::default().queue_capacity,
        }
    }

    pub fn session_config(&self, role: Role) -> SessionConfig {
        let mut config = SessionConfig::new(self.name.clone(), role);
        config.video_capacity = config.video_capacity.max(self.pipeline.channel_capacity);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_gives_defaults() {
        let cfg = NodeConfig::from_toml_str("  \n").unwrap();
        assert_eq!(cfg.version, CONFIG_VERSION);
        assert!(cfg.name.starts_with("vidlink-"));
        assert_eq!(cfg.video, VideoConfig::default());
        assert_eq!(cfg.network.listen, DEFAULT_LISTEN.parse::<SocketAddr>().unwrap());
        assert!(cfg.network.peers.is_empty());
        assert_eq!(cfg.pipeline.channel_capacity, 64);
    }

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            version = 1

            [node]
            name = "living-room"

            [video]
            width = 1280
            height = 720
            fps = 25
            quality = 1.5
            keyframe_interval = 0
            profile = "main_auto"

            [network]
            listen = "127.0.0.1:9000"

            [[network.peers]]
            name = "camera"
            addr = "192.168.1.20:7878"

            [[network.peers]]
            name = "camera"
            addr = "192.168.1.21:7878"

            [[network.peers]]
            name = "  "
            addr = "junk"

            [pipeline]
            channel_capacity = 16
            max_pending_bytes = 4194304
        "#;

        let cfg = NodeConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.name, "living-room");
        assert_eq!((cfg.video.width, cfg.video.height, cfg.video.fps), (1280, 720, 25));
        assert_eq!(cfg.video.quality, 1.0);
        assert_eq!(cfg.video.keyframe_interval, 1);
        assert_eq!(cfg.video.profile, ProfileLevel::MainAuto);
        assert_eq!(cfg.network.listen, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(
            cfg.network.peers,
            vec![Endpoint::new("camera", "192.168.1.20:7878".parse().unwrap())]
        );
        assert_eq!(cfg.pipeline.channel_capacity, 16);
        assert_eq!(cfg.pipeline.parser.max_pending, 4 * 1024 * 1024);

        let enc = cfg.encoder_config();
        assert_eq!((enc.width, enc.height), (1280, 720));
        assert_eq!(enc.profile, ProfileLevel::MainAuto);
    }

    #[test]
    fn rejects_unknown_version() {
        let err = NodeConfig::from_toml_str("version = 7").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion(7)));
    }

    #[test]
    fn rejects_odd_dimensions() {
        let err = NodeConfig::from_toml_str("[video]\nwidth = 641").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { section: "video", .. }));
    }

    #[test]
    fn overridden_video_settings_are_revalidated() {
        let mut cfg = NodeConfig::default();
        cfg.video.width = 33;
        assert!(matches!(cfg.video.validate(), Err(ConfigError::Invalid { section: "video", .. })));

        cfg.video.width = 32;
        cfg.video.fps = 0;
        assert!(cfg.video.validate().is_err());

        cfg.video.fps = 60;
        assert!(cfg.video.validate().is_ok());
    }

    #[test]
    fn rejects_bad_peer_address() {
        let toml = r#"
            [[network.peers]]
            name = "cam"
            addr = "not-an-address"
        "#;
        let err = NodeConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { section: "network", .. }));
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(matches!(
            NodeConfig::from_toml_str("[video"),
            Err(ConfigError::Toml(_))
        ));
    }
}
