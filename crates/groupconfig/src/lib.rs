use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialise configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Identifier of a toggle group, stable across config reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

/// Content hash of a compiled shader. `0` is the "no shader" identity and
/// never matches a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ShaderIdentity(pub u32);

impl ShaderIdentity {
    pub const NONE: ShaderIdentity = ShaderIdentity(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ShaderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl Serialize for ShaderIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ShaderIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_flexible_u32(deserializer).map(ShaderIdentity)
    }
}

/// Where a group's side effects are executed relative to the matched draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationLocation {
    BeforeDraw,
    #[default]
    AfterDraw,
    OnRenderTargetChange,
}

/// Policy for accepting a bound render target as the effect target, relative
/// to the swapchain resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapchainMatchMode {
    Resolution,
    #[default]
    AspectRatio,
    ExtendedAspectRatio,
    None,
}

/// How constant buffer contents are captured into host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStrategyKind {
    #[default]
    GpuReadback,
    HostShadow,
    BulkCopy,
}

/// Whether texture bindings alias the host's view or copy into an owned texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingMode {
    #[default]
    Copy,
    Alias,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingSource {
    #[default]
    RenderTarget,
    ShaderResource,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TextureBindingConfig {
    pub name: String,
    #[serde(default)]
    pub source: BindingSource,
    #[serde(default)]
    pub slot_index: u32,
    #[serde(default)]
    pub descriptor_index: u32,
    /// Overrides `settings.binding_mode` for this binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy: Option<bool>,
}

impl TextureBindingConfig {
    pub fn mode(&self, default: BindingMode) -> BindingMode {
        match self.copy {
            Some(true) => BindingMode::Copy,
            Some(false) => BindingMode::Alias,
            None => default,
        }
    }
}

/// A byte offset inside a captured constant buffer, optionally read from the
/// previous frame's copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct VarOffset {
    #[serde(deserialize_with = "deserialize_flexible_u32")]
    pub offset: u32,
    #[serde(default)]
    pub previous: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct ConstantExtractionConfig {
    #[serde(default)]
    pub slot_index: u32,
    #[serde(default)]
    pub descriptor_index: u32,
    #[serde(default)]
    pub offsets: BTreeMap<String, VarOffset>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToggleGroup {
    pub id: GroupId,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub pixel_shaders: BTreeSet<ShaderIdentity>,
    #[serde(default)]
    pub vertex_shaders: BTreeSet<ShaderIdentity>,
    #[serde(default)]
    pub techniques: Vec<String>,
    #[serde(default)]
    pub render_target_index: u32,
    #[serde(default)]
    pub invocation: InvocationLocation,
    #[serde(default)]
    pub match_mode: SwapchainMatchMode,
    #[serde(default)]
    pub requeue_after_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<TextureBindingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constants: Option<ConstantExtractionConfig>,
}

impl ToggleGroup {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id: GroupId(id),
            name: name.into(),
            active: true,
            pixel_shaders: BTreeSet::new(),
            vertex_shaders: BTreeSet::new(),
            techniques: Vec::new(),
            render_target_index: 0,
            invocation: InvocationLocation::default(),
            match_mode: SwapchainMatchMode::default(),
            requeue_after_failure: false,
            binding: None,
            constants: None,
        }
    }

    pub fn has_side_effects(&self) -> bool {
        !self.techniques.is_empty() || self.binding.is_some() || self.constants.is_some()
    }

    pub fn label(&self) -> String {
        if self.name.is_empty() {
            self.id.to_string()
        } else {
            format!("{} ({})", self.name, self.id)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub constant_capture: CaptureStrategyKind,
    #[serde(default)]
    pub binding_mode: BindingMode,
    /// Failed resolutions tolerated per frame before a requeued action is
    /// abandoned; `0` retries forever.
    #[serde(default)]
    pub requeue_limit: u32,
    #[serde(default = "default_true")]
    pub effects_enabled: bool,
    #[serde(default)]
    pub techniques: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            constant_capture: CaptureStrategyKind::default(),
            binding_mode: BindingMode::default(),
            requeue_limit: 0,
            effects_enabled: true,
            techniques: Vec::new(),
        }
    }
}

impl Settings {
    pub fn retry_limit(&self) -> Option<u32> {
        (self.requeue_limit > 0).then_some(self.requeue_limit)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HookConfig {
    pub version: u32,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub groups: Vec<ToggleGroup>,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            version: 1,
            settings: Settings::default(),
            groups: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn deserialize_flexible_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Helper {
        Str(String),
        Num(i64),
    }

    match Helper::deserialize(deserializer)? {
        Helper::Str(raw) => parse_u32(&raw).map_err(de::Error::custom),
        Helper::Num(value) => u32::try_from(value)
            .map_err(|_| de::Error::custom(format!("value {value} does not fit in 32 bits"))),
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal 32-bit value.
pub fn parse_u32(raw: &str) -> Result<u32, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("value must not be empty".to_string());
    }
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => trimmed.parse::<u32>(),
    };
    parsed.map_err(|err| format!("invalid 32-bit value '{trimmed}': {err}"))
}

impl HookConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: HookConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn group(&self, id: GroupId) -> Option<&ToggleGroup> {
        self.groups.iter().find(|group| group.id == id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        let mut seen = HashSet::new();
        for group in &self.groups {
            let label = group.label();
            if !seen.insert(group.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate group id {}",
                    group.id.0
                )));
            }

            if group
                .pixel_shaders
                .iter()
                .chain(group.vertex_shaders.iter())
                .any(|identity| identity.is_none())
            {
                return Err(ConfigError::Invalid(format!(
                    "group '{label}' lists shader identity 0, which never matches"
                )));
            }

            if group.techniques.iter().any(|name| name.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "group '{label}' contains an empty technique name"
                )));
            }

            if let Some(binding) = &group.binding {
                if binding.name.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "group '{label}' binding name must not be empty"
                    )));
                }
            }

            if let Some(constants) = &group.constants {
                for (name, var) in &constants.offsets {
                    if name.trim().is_empty() {
                        return Err(ConfigError::Invalid(format!(
                            "group '{label}' contains a constant with an empty name"
                        )));
                    }
                    if var.offset % 4 != 0 {
                        return Err(ConfigError::Invalid(format!(
                            "group '{label}' constant '{name}' offset 0x{:X} is not 4-byte aligned",
                            var.offset
                        )));
                    }
                }
            }
        }

        if self.settings.techniques.iter().any(|name| name.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "settings.techniques contains an empty technique name".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version = 1

[settings]
constant_capture = "host_shadow"
binding_mode = "alias"
requeue_limit = 3
techniques = ["Bloom", "SMAA"]

[[groups]]
id = 1
name = "HUD"
pixel_shaders = ["0x1A2B3C4D", 12345]
techniques = ["Bloom"]
invocation = "before_draw"
match_mode = "resolution"
requeue_after_failure = true

[groups.binding]
name = "HudTexture"
source = "shader_resource"
slot_index = 2
descriptor_index = 1

[groups.constants]
slot_index = 1

[groups.constants.offsets]
CameraPos = { offset = "0x10" }
PrevCameraPos = { offset = 16, previous = true }

[[groups]]
id = 2
vertex_shaders = ["0xDEADBEEF"]
"#;

    #[test]
    fn parses_sample_config() {
        let config = HookConfig::from_toml_str(SAMPLE).expect("parse config");
        assert_eq!(config.settings.constant_capture, CaptureStrategyKind::HostShadow);
        assert_eq!(config.settings.retry_limit(), Some(3));

        let hud = config.group(GroupId(1)).expect("group 1");
        assert!(hud.active);
        assert!(hud.pixel_shaders.contains(&ShaderIdentity(0x1A2B_3C4D)));
        assert!(hud.pixel_shaders.contains(&ShaderIdentity(12345)));
        assert_eq!(hud.invocation, InvocationLocation::BeforeDraw);
        assert_eq!(hud.match_mode, SwapchainMatchMode::Resolution);

        let binding = hud.binding.as_ref().expect("binding");
        assert_eq!(binding.source, BindingSource::ShaderResource);
        assert_eq!(binding.mode(config.settings.binding_mode), BindingMode::Alias);

        let constants = hud.constants.as_ref().expect("constants");
        assert_eq!(
            constants.offsets.get("CameraPos"),
            Some(&VarOffset {
                offset: 0x10,
                previous: false
            })
        );
        assert!(constants.offsets["PrevCameraPos"].previous);

        let second = config.group(GroupId(2)).expect("group 2");
        assert_eq!(second.invocation, InvocationLocation::AfterDraw);
        assert_eq!(second.match_mode, SwapchainMatchMode::AspectRatio);
        assert!(!second.has_side_effects());
    }

    #[test]
    fn rejects_duplicate_group_ids() {
        let err = HookConfig::from_toml_str(
            r#"
version = 1

[[groups]]
id = 4

[[groups]]
id = 4
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_shader_identity() {
        let err = HookConfig::from_toml_str(
            r#"
version = 1

[[groups]]
id = 1
pixel_shaders = [0]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_unaligned_offset() {
        let err = HookConfig::from_toml_str(
            r#"
version = 1

[[groups]]
id = 1

[groups.constants.offsets]
Bad = { offset = 6 }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_unknown_version() {
        let err = HookConfig::from_toml_str("version = 2").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn parses_hex_values() {
        assert_eq!(parse_u32("0x10"), Ok(16));
        assert_eq!(parse_u32(" 42 "), Ok(42));
        assert!(parse_u32("0xZZ").is_err());
        assert!(parse_u32("").is_err());
    }

    #[test]
    fn survives_serialisation() {
        let config = HookConfig::from_toml_str(SAMPLE).unwrap();
        let rendered = config.to_toml_string().unwrap();
        let reparsed = HookConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("groups.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = HookConfig::load(&path).unwrap();
        assert_eq!(config.groups.len(), 2);

        let missing = HookConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
