//! Capability detection from the device model string.
//!
//! Capabilities are computed purely from the model prefix; no network
//! round-trip is involved. Unknown prefixes are an explicit error so the
//! factory can fall back to a hinted variant.

use crate::error::TapoError;

/// Feature flags derived from the model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub power: bool,
    pub brightness: bool,
    pub color: bool,
    pub color_temperature: bool,
    pub light_effects: bool,
    pub energy_monitoring: bool,
    pub child_outlets: bool,
    pub min_brightness: u8,
    pub max_brightness: u8,
    pub min_color_temp: u16,
    pub max_color_temp: u16,
}

impl Capabilities {
    const fn power_only() -> Self {
        Self {
            power: true,
            brightness: false,
            color: false,
            color_temperature: false,
            light_effects: false,
            energy_monitoring: false,
            child_outlets: false,
            min_brightness: 0,
            max_brightness: 0,
            min_color_temp: 0,
            max_color_temp: 0,
        }
    }

    const fn dimmable() -> Self {
        Self {
            brightness: true,
            min_brightness: 1,
            max_brightness: 100,
            ..Self::power_only()
        }
    }

    const fn tunable() -> Self {
        Self {
            color_temperature: true,
            min_color_temp: 2500,
            max_color_temp: 6500,
            ..Self::dimmable()
        }
    }

    const fn full_color() -> Self {
        Self {
            color: true,
            light_effects: true,
            ..Self::tunable()
        }
    }
}

/// Model families recognized by the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    BasicPlug,
    EnergyPlug,
    PowerStrip,
    DimmableBulb,
    TunableBulb,
    ColorBulb,
    LightStrip,
}

impl DeviceFamily {
    pub fn capabilities(self, model: &str) -> Capabilities {
        match self {
            DeviceFamily::BasicPlug => Capabilities::power_only(),
            DeviceFamily::EnergyPlug => Capabilities {
                energy_monitoring: true,
                ..Capabilities::power_only()
            },
            DeviceFamily::PowerStrip => Capabilities {
                child_outlets: true,
                ..Capabilities::power_only()
            },
            DeviceFamily::DimmableBulb => Capabilities::dimmable(),
            DeviceFamily::TunableBulb => Capabilities::tunable(),
            DeviceFamily::ColorBulb => Capabilities::full_color(),
            DeviceFamily::LightStrip => {
                let upper = model.to_ascii_uppercase();
                // L920/L930 strips also do color temperature and effects.
                if upper.starts_with("L92") || upper.starts_with("L93") {
                    Capabilities::full_color()
                } else {
                    Capabilities {
                        color: true,
                        ..Capabilities::dimmable()
                    }
                }
            }
        }
    }
}

/// Known model prefixes, most specific first.
const MODEL_FAMILIES: &[(&str, DeviceFamily)] = &[
    ("P100", DeviceFamily::BasicPlug),
    ("P105", DeviceFamily::BasicPlug),
    ("P110", DeviceFamily::EnergyPlug),
    ("P115", DeviceFamily::EnergyPlug),
    ("P300", DeviceFamily::PowerStrip),
    ("P304", DeviceFamily::PowerStrip),
    ("KP303", DeviceFamily::PowerStrip),
    ("KP400", DeviceFamily::PowerStrip),
    ("L510", DeviceFamily::DimmableBulb),
    ("L610", DeviceFamily::DimmableBulb),
    ("L520", DeviceFamily::TunableBulb),
    ("L530", DeviceFamily::ColorBulb),
    ("L535", DeviceFamily::ColorBulb),
    ("L630", DeviceFamily::ColorBulb),
    ("L900", DeviceFamily::LightStrip),
    ("L920", DeviceFamily::LightStrip),
    ("L930", DeviceFamily::LightStrip),
];

/// Resolves a model string (e.g. `"L530 Series"`, `"p110"`) to its family.
pub fn family_for_model(model: &str) -> Option<DeviceFamily> {
    let upper = model.trim().to_ascii_uppercase();
    MODEL_FAMILIES
        .iter()
        .find(|(prefix, _)| upper.starts_with(prefix))
        .map(|(_, family)| *family)
}

pub fn capabilities_for_model(model: &str) -> Result<Capabilities, TapoError> {
    family_for_model(model)
        .map(|family| family.capabilities(model))
        .ok_or_else(|| TapoError::UnknownDeviceModel(model.to_string()))
}

/// Kasa strips classify for capability queries, but the KLAP stack is not
/// documented for them; the factory keeps them on passthrough.
pub fn is_kasa_model(model: &str) -> bool {
    model.trim().to_ascii_uppercase().starts_with("KP")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plug_families() {
        let p100 = capabilities_for_model("P100").unwrap();
        assert!(p100.power);
        assert!(!p100.energy_monitoring);

        let p110 = capabilities_for_model("P110").unwrap();
        assert!(p110.energy_monitoring);
        // P110M shares the P110 prefix.
        assert!(capabilities_for_model("P110M").unwrap().energy_monitoring);

        let p115 = capabilities_for_model("p115").unwrap();
        assert!(p115.energy_monitoring);
    }

    #[test]
    fn strips_have_child_outlets() {
        for model in ["P300", "P304", "KP303", "KP400"] {
            let caps = capabilities_for_model(model).unwrap();
            assert!(caps.child_outlets, "{model}");
            assert!(!caps.brightness, "{model}");
        }
        assert!(is_kasa_model("KP303"));
        assert!(!is_kasa_model("P300"));
    }

    #[test]
    fn bulb_families() {
        let l510 = capabilities_for_model("L510 Series").unwrap();
        assert!(l510.brightness && !l510.color_temperature);
        assert_eq!((l510.min_brightness, l510.max_brightness), (1, 100));

        let l520 = capabilities_for_model("L520").unwrap();
        assert!(l520.color_temperature && !l520.color);
        assert_eq!((l520.min_color_temp, l520.max_color_temp), (2500, 6500));

        let l530 = capabilities_for_model("L530E").unwrap();
        assert!(l530.color && l530.color_temperature && l530.light_effects);
    }

    #[test]
    fn light_strip_variants() {
        let l900 = capabilities_for_model("L900-10").unwrap();
        assert!(l900.color && !l900.color_temperature && !l900.light_effects);

        let l930 = capabilities_for_model("L930-5").unwrap();
        assert!(l930.color && l930.color_temperature && l930.light_effects);
    }

    #[test]
    fn unknown_model_is_an_error() {
        assert!(matches!(
            capabilities_for_model("C200"),
            Err(TapoError::UnknownDeviceModel(_))
        ));
        assert_eq!(family_for_model("HS100"), None);
    }
}
