//! Attack variants and the per-run parameters that identify a poisoned set.

use super::{DatasetId, PoisonsetError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of attack variants. String ids match the ones used on the
/// command line and in batch configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AttackVariant {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "basic")]
    Basic,
    #[serde(rename = "badnet")]
    Badnet,
    #[serde(rename = "badnet_all_to_all")]
    BadnetAllToAll,
    #[serde(rename = "trojan")]
    Trojan,
    #[serde(rename = "blend")]
    Blend,
    #[serde(rename = "SIG")]
    Sig,
    #[serde(rename = "TaCT")]
    Tact,
    #[serde(rename = "WaNet")]
    WaNet,
    #[serde(rename = "adaptive")]
    Adaptive,
    #[serde(rename = "adaptive_blend")]
    AdaptiveBlend,
    #[serde(rename = "adaptive_patch")]
    AdaptivePatch,
    #[serde(rename = "adaptive_k_way")]
    AdaptiveKWay,
    #[serde(rename = "clean_label")]
    CleanLabel,
    #[serde(rename = "dynamic")]
    Dynamic,
    #[serde(rename = "ISSBA")]
    Issba,
}

impl AttackVariant {
    pub const ALL: [AttackVariant; 16] = [
        AttackVariant::None,
        AttackVariant::Basic,
        AttackVariant::Badnet,
        AttackVariant::BadnetAllToAll,
        AttackVariant::Trojan,
        AttackVariant::Blend,
        AttackVariant::Sig,
        AttackVariant::Tact,
        AttackVariant::WaNet,
        AttackVariant::Adaptive,
        AttackVariant::AdaptiveBlend,
        AttackVariant::AdaptivePatch,
        AttackVariant::AdaptiveKWay,
        AttackVariant::CleanLabel,
        AttackVariant::Dynamic,
        AttackVariant::Issba,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Basic => "basic",
            Self::Badnet => "badnet",
            Self::BadnetAllToAll => "badnet_all_to_all",
            Self::Trojan => "trojan",
            Self::Blend => "blend",
            Self::Sig => "SIG",
            Self::Tact => "TaCT",
            Self::WaNet => "WaNet",
            Self::Adaptive => "adaptive",
            Self::AdaptiveBlend => "adaptive_blend",
            Self::AdaptivePatch => "adaptive_patch",
            Self::AdaptiveKWay => "adaptive_k_way",
            Self::CleanLabel => "clean_label",
            Self::Dynamic => "dynamic",
            Self::Issba => "ISSBA",
        }
    }

    /// Variants that also sample a cover population.
    pub fn uses_cover(self) -> bool {
        matches!(
            self,
            Self::Tact
                | Self::WaNet
                | Self::Adaptive
                | Self::AdaptiveBlend
                | Self::AdaptivePatch
                | Self::AdaptiveKWay
        )
    }

    /// Variants whose trigger strength is controlled by `alpha`.
    pub fn uses_alpha(self) -> bool {
        matches!(
            self,
            Self::Basic | Self::Blend | Self::Adaptive | Self::AdaptiveBlend
        )
    }

    /// Variants that read a trigger asset from the triggers directory.
    pub fn uses_trigger(self) -> bool {
        matches!(
            self,
            Self::Basic
                | Self::Badnet
                | Self::BadnetAllToAll
                | Self::Trojan
                | Self::Blend
                | Self::Tact
                | Self::Adaptive
                | Self::AdaptiveBlend
                | Self::CleanLabel
        )
    }

    /// Variants that add the trigger without changing the label.
    pub fn is_clean_label(self) -> bool {
        matches!(self, Self::Sig | Self::CleanLabel)
    }

    pub fn supports(self, dataset: DatasetId) -> bool {
        match self {
            Self::Dynamic | Self::Issba => {
                matches!(dataset, DatasetId::Cifar10 | DatasetId::Gtsrb)
            }
            Self::CleanLabel => dataset == DatasetId::Cifar10,
            _ => true,
        }
    }
}

impl fmt::Display for AttackVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttackVariant {
    type Err = PoisonsetError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| PoisonsetError::InvalidParameter(format!("'{s}' not defined")))
    }
}

/// Parameters that fully identify one poisoned set.
///
/// The artifact directory is a pure function of these values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackParams {
    pub dataset: DatasetId,
    pub variant: AttackVariant,
    pub poison_rate: f64,
    #[serde(default)]
    pub cover_rate: f64,
    #[serde(default)]
    pub alpha: f64,
    /// Trigger file name; `None` selects the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(default = "default_data_rate")]
    pub data_rate: f64,
    #[serde(default)]
    pub seed: u64,
}

fn default_data_rate() -> f64 {
    1.0
}

impl AttackParams {
    pub fn new(dataset: DatasetId, variant: AttackVariant, poison_rate: f64) -> Self {
        Self {
            dataset,
            variant,
            poison_rate,
            cover_rate: 0.0,
            alpha: 0.0,
            trigger: None,
            data_rate: 1.0,
            seed: 0,
        }
    }

    /// Range checks and dataset/variant compatibility.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("poison_rate", self.poison_rate),
            ("cover_rate", self.cover_rate),
            ("alpha", self.alpha),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PoisonsetError::InvalidParameter(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.data_rate.is_nan() || self.data_rate < 0.0 {
            return Err(PoisonsetError::InvalidParameter(format!(
                "data_rate must be non-negative, got {}",
                self.data_rate
            )));
        }
        if !self.variant.supports(self.dataset) {
            return Err(PoisonsetError::UnsupportedCombination {
                dataset: self.dataset.to_string(),
                variant: self.variant.to_string(),
            });
        }
        Ok(())
    }

    /// True when the clean set is down-sampled before poisoning.
    pub fn is_reduced(&self) -> bool {
        self.data_rate < 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_ids_round_trip_through_strings() {
        for v in AttackVariant::ALL {
            assert_eq!(v.as_str().parse::<AttackVariant>().unwrap(), v);
        }
        assert!("Badnet".parse::<AttackVariant>().is_err());
    }

    #[test]
    fn test_support_matrix() {
        assert!(AttackVariant::Dynamic.supports(DatasetId::Gtsrb));
        assert!(!AttackVariant::Dynamic.supports(DatasetId::Imagenette));
        assert!(!AttackVariant::Issba.supports(DatasetId::Stl10));
        assert!(!AttackVariant::CleanLabel.supports(DatasetId::Gtsrb));
        assert!(AttackVariant::WaNet.supports(DatasetId::Imagenette));
    }

    #[test]
    fn test_adaptive_family_capabilities() {
        for v in [AttackVariant::Adaptive, AttackVariant::AdaptiveKWay] {
            assert!(v.uses_cover());
            assert!(v.supports(DatasetId::Stl10));
        }
        assert!(AttackVariant::Adaptive.uses_alpha());
        assert!(AttackVariant::Adaptive.uses_trigger());
        assert!(!AttackVariant::AdaptiveKWay.uses_trigger());
        assert_eq!("adaptive_k_way".parse::<AttackVariant>().unwrap(), AttackVariant::AdaptiveKWay);
        assert!("refool".parse::<AttackVariant>().is_err());
    }

    #[test]
    fn test_validate_rejects_unsupported_pair() {
        let params = AttackParams::new(DatasetId::Imagenette, AttackVariant::Issba, 0.1);
        let err = params.validate().unwrap_err();
        assert!(matches!(err, PoisonsetError::UnsupportedCombination { .. }));
    }

    #[test]
    fn test_validate_rejects_out_of_range_rates() {
        let mut params = AttackParams::new(DatasetId::Cifar10, AttackVariant::Badnet, 1.5);
        assert!(params.validate().is_err());
        params.poison_rate = 0.1;
        params.data_rate = -0.5;
        assert!(params.validate().is_err());
        params.data_rate = 0.5;
        assert!(params.validate().is_ok());
    }
}
