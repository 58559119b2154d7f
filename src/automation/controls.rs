//! Machine controls mirrored to the automation hub and their payload codec.

use super::BridgeError;
use bstr::ByteSlice;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Control {
    Power,
    Mode,
    TargetTemperature,
    SteamPower,
    PreinfusionTime,
    LastShot,
    Backflush,
}

impl Control {
    pub const ALL: [Control; 7] = [
        Control::Power,
        Control::Mode,
        Control::TargetTemperature,
        Control::SteamPower,
        Control::PreinfusionTime,
        Control::LastShot,
        Control::Backflush,
    ];

    pub fn component(&self) -> &'static str {
        match self {
            Control::Power | Control::Backflush => "switch",
            Control::Mode => "select",
            Control::TargetTemperature
            | Control::SteamPower
            | Control::PreinfusionTime
            | Control::LastShot => "number",
        }
    }

    pub fn object_id(&self) -> &'static str {
        match self {
            Control::Power => "power",
            Control::Mode => "mode",
            Control::TargetTemperature => "target_temp",
            Control::SteamPower => "steam_power",
            Control::PreinfusionTime => "preinfusion_time",
            Control::LastShot => "last_shot",
            Control::Backflush => "backflush",
        }
    }

    /// Last-shot duration is reported by the hub, never echoed back.
    pub fn acknowledges(&self) -> bool {
        !matches!(self, Control::LastShot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PreinfusionMode {
    PreBrew,
    PreInfusion,
    Disabled,
}

impl PreinfusionMode {
    pub const OPTIONS: [PreinfusionMode; 3] = [
        PreinfusionMode::PreBrew,
        PreinfusionMode::PreInfusion,
        PreinfusionMode::Disabled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PreinfusionMode::PreBrew => "Pre-brew",
            PreinfusionMode::PreInfusion => "Pre-infusion",
            PreinfusionMode::Disabled => "Disabled",
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::OPTIONS.get(index).copied()
    }

    /// Accepts the option label or its index.
    pub fn parse(text: &str) -> Option<Self> {
        Self::OPTIONS
            .iter()
            .copied()
            .find(|m| m.as_str() == text)
            .or_else(|| text.parse::<usize>().ok().and_then(Self::from_index))
    }
}

pub const TARGET_TEMPERATURE_RANGE: (f32, f32) = (85.0, 100.0);
pub const STEAM_POWER_RANGE: (u8, u8) = (1, 3);
pub const PREINFUSION_TIME_RANGE: (f32, f32) = (0.0, 10.0);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlValue {
    Power(bool),
    Mode(PreinfusionMode),
    TargetTemperature(f32),
    SteamPower(u8),
    PreinfusionTime(f32),
    LastShot(f32),
    Backflush(bool),
}

fn round_tenth(v: f32) -> f32 {
    (v * 10.0).round() / 10.0
}

fn parse_switch(text: &str) -> Option<bool> {
    match text {
        "ON" => Some(true),
        "OFF" => Some(false),
        _ => None,
    }
}

fn parse_decimal(control: Control, text: &str, min: f32, max: f32) -> Result<f32, BridgeError> {
    let value: f32 = text
        .parse()
        .map_err(|_| BridgeError::InvalidPayload { control, payload: text.to_string() })?;
    if !value.is_finite() || value < min || value > max {
        return Err(BridgeError::OutOfRange { control, payload: text.to_string() });
    }
    Ok(round_tenth(value))
}

impl ControlValue {
    pub fn control(&self) -> Control {
        match self {
            ControlValue::Power(_) => Control::Power,
            ControlValue::Mode(_) => Control::Mode,
            ControlValue::TargetTemperature(_) => Control::TargetTemperature,
            ControlValue::SteamPower(_) => Control::SteamPower,
            ControlValue::PreinfusionTime(_) => Control::PreinfusionTime,
            ControlValue::LastShot(_) => Control::LastShot,
            ControlValue::Backflush(_) => Control::Backflush,
        }
    }

    /// Decodes and validates a payload for `control`.
    pub fn parse(control: Control, payload: &[u8]) -> Result<Self, BridgeError> {
        let text = payload
            .trim()
            .to_str()
            .map_err(|_| BridgeError::InvalidPayload {
                control,
                payload: payload.to_str_lossy().into_owned(),
            })?;
        let invalid = || BridgeError::InvalidPayload { control, payload: text.to_string() };

        match control {
            Control::Power => parse_switch(text).map(ControlValue::Power).ok_or_else(invalid),
            Control::Backflush => parse_switch(text).map(ControlValue::Backflush).ok_or_else(invalid),
            Control::Mode => PreinfusionMode::parse(text).map(ControlValue::Mode).ok_or_else(invalid),
            Control::TargetTemperature => {
                let (min, max) = TARGET_TEMPERATURE_RANGE;
                parse_decimal(control, text, min, max).map(ControlValue::TargetTemperature)
            }
            Control::SteamPower => {
                // Number entities may send "2" or "2.0".
                let value: f32 = text.parse().map_err(|_| invalid())?;
                let (min, max) = STEAM_POWER_RANGE;
                if value.fract() != 0.0 || value < min as f32 || value > max as f32 {
                    return Err(BridgeError::OutOfRange { control, payload: text.to_string() });
                }
                Ok(ControlValue::SteamPower(value as u8))
            }
            Control::PreinfusionTime => {
                let (min, max) = PREINFUSION_TIME_RANGE;
                parse_decimal(control, text, min, max).map(ControlValue::PreinfusionTime)
            }
            Control::LastShot => parse_decimal(control, text, 0.0, f32::MAX).map(ControlValue::LastShot),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            ControlValue::Power(on) | ControlValue::Backflush(on) => {
                if *on { "ON" } else { "OFF" }.to_string()
            }
            ControlValue::Mode(mode) => mode.as_str().to_string(),
            ControlValue::TargetTemperature(v)
            | ControlValue::PreinfusionTime(v)
            | ControlValue::LastShot(v) => format!("{:.1}", v),
            ControlValue::SteamPower(v) => v.to_string(),
        }
    }
}

/// Last known machine state as seen by the hub.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MachineShadow {
    pub power: Option<bool>,
    pub mode: Option<PreinfusionMode>,
    pub target_temperature: Option<f32>,
    pub steam_power: Option<u8>,
    pub preinfusion_time: Option<f32>,
    pub last_shot: Option<f32>,
    pub backflush: Option<bool>,
}

impl MachineShadow {
    pub fn apply(&mut self, value: ControlValue) {
        match value {
            ControlValue::Power(v) => self.power = Some(v),
            ControlValue::Mode(v) => self.mode = Some(v),
            ControlValue::TargetTemperature(v) => self.target_temperature = Some(v),
            ControlValue::SteamPower(v) => self.steam_power = Some(v),
            ControlValue::PreinfusionTime(v) => self.preinfusion_time = Some(v),
            ControlValue::LastShot(v) => self.last_shot = Some(v),
            ControlValue::Backflush(v) => self.backflush = Some(v),
        }
    }

    /// One-line summary for the status display.
    pub fn summary(&self) -> String {
        let power = match self.power {
            Some(true) => "ON",
            Some(false) => "OFF",
            None => "--",
        };
        match self.target_temperature {
            Some(t) => format!("{} {:.1}C", power, t),
            None => power.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// Hub asks the device to change a control.
    Command,
    /// Hub mirrors the machine's actual state.
    State,
}

/// `<prefix>/<component>/<device>_<object>/{set,state}`
#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
    device: String,
}

impl Topics {
    pub fn new(prefix: &str, device: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            device: device.to_string(),
        }
    }

    fn base(&self, control: Control) -> String {
        format!(
            "{}/{}/{}_{}",
            self.prefix,
            control.component(),
            self.device,
            control.object_id()
        )
    }

    pub fn command(&self, control: Control) -> String {
        format!("{}/set", self.base(control))
    }

    pub fn state(&self, control: Control) -> String {
        format!("{}/state", self.base(control))
    }

    pub fn subscriptions(&self) -> Vec<String> {
        Control::ALL
            .iter()
            .flat_map(|c| [self.command(*c), self.state(*c)])
            .collect()
    }

    pub fn classify(&self, topic: &str) -> Option<(Control, TopicKind)> {
        Control::ALL.iter().find_map(|c| {
            let base = self.base(*c);
            let suffix = topic.strip_prefix(base.as_str())?;
            match suffix {
                "/set" => Some((*c, TopicKind::Command)),
                "/state" => Some((*c, TopicKind::State)),
                _ => None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_layout() {
        let topics = Topics::new("homeassistant", "linea_micra");
        assert_eq!(
            topics.state(Control::Power),
            "homeassistant/switch/linea_micra_power/state"
        );
        assert_eq!(
            topics.command(Control::TargetTemperature),
            "homeassistant/number/linea_micra_target_temp/set"
        );
        assert_eq!(
            topics.state(Control::Mode),
            "homeassistant/select/linea_micra_mode/state"
        );
        assert_eq!(topics.subscriptions().len(), 14);
    }

    #[test]
    fn test_classify() {
        let topics = Topics::new("homeassistant", "linea_micra");
        assert_eq!(
            topics.classify("homeassistant/number/linea_micra_steam_power/set"),
            Some((Control::SteamPower, TopicKind::Command))
        );
        assert_eq!(
            topics.classify("homeassistant/number/linea_micra_last_shot/state"),
            Some((Control::LastShot, TopicKind::State))
        );
        assert_eq!(topics.classify("homeassistant/number/linea_micra_last_shot/config"), None);
        assert_eq!(topics.classify("shotstopper/status"), None);
    }

    #[test]
    fn test_parse_switch() {
        assert_eq!(ControlValue::parse(Control::Power, b"ON").unwrap(), ControlValue::Power(true));
        assert_eq!(ControlValue::parse(Control::Backflush, b" OFF\n").unwrap(), ControlValue::Backflush(false));
        assert!(ControlValue::parse(Control::Power, b"on").is_err());
    }

    #[test]
    fn test_parse_mode_label_or_index() {
        assert_eq!(
            ControlValue::parse(Control::Mode, b"Pre-infusion").unwrap(),
            ControlValue::Mode(PreinfusionMode::PreInfusion)
        );
        assert_eq!(
            ControlValue::parse(Control::Mode, b"2").unwrap(),
            ControlValue::Mode(PreinfusionMode::Disabled)
        );
        assert!(ControlValue::parse(Control::Mode, b"3").is_err());
    }

    #[test]
    fn test_temperature_bounds_and_step() {
        assert_eq!(
            ControlValue::parse(Control::TargetTemperature, b"93.04").unwrap(),
            ControlValue::TargetTemperature(93.0)
        );
        assert!(matches!(
            ControlValue::parse(Control::TargetTemperature, b"84.9"),
            Err(BridgeError::OutOfRange { .. })
        ));
        assert!(matches!(
            ControlValue::parse(Control::TargetTemperature, b"hot"),
            Err(BridgeError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_steam_power_integers_only() {
        assert_eq!(ControlValue::parse(Control::SteamPower, b"2").unwrap(), ControlValue::SteamPower(2));
        assert_eq!(ControlValue::parse(Control::SteamPower, b"3.0").unwrap(), ControlValue::SteamPower(3));
        assert!(ControlValue::parse(Control::SteamPower, b"0").is_err());
        assert!(ControlValue::parse(Control::SteamPower, b"1.5").is_err());
    }

    #[test]
    fn test_encode() {
        assert_eq!(ControlValue::TargetTemperature(93.0).encode(), "93.0");
        assert_eq!(ControlValue::Mode(PreinfusionMode::PreBrew).encode(), "Pre-brew");
        assert_eq!(ControlValue::Backflush(true).encode(), "ON");
        assert_eq!(ControlValue::SteamPower(2).encode(), "2");
    }

    #[test]
    fn test_shadow_summary() {
        let mut shadow = MachineShadow::default();
        assert_eq!(shadow.summary(), "--");
        shadow.apply(ControlValue::Power(true));
        shadow.apply(ControlValue::TargetTemperature(93.5));
        assert_eq!(shadow.summary(), "ON 93.5C");
    }
}
