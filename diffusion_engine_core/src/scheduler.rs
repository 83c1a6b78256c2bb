use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
    #[serde(rename = "squaredcos_cap_v2")]
    SquaredCosCapV2,
    Sigmoid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    Epsilon,
    VPrediction,
    Sample,
    FlowPrediction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceType {
    FixedSmall,
    FixedSmallLog,
    FixedLarge,
    FixedLargeLog,
    Learned,
    LearnedRange,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestepSpacing {
    Linspace,
    Leading,
    Trailing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverType {
    Midpoint,
    Heun,
    Logrho,
    Bh1,
    Bh2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum AlgorithmType {
    #[serde(rename = "dpmsolver")]
    DpmSolver,
    #[serde(rename = "dpmsolver++")]
    DpmSolverPlusPlus,
    #[serde(rename = "sde-dpmsolver")]
    SdeDpmSolver,
    #[serde(rename = "sde-dpmsolver++")]
    SdeDpmSolverPlusPlus,
    #[serde(rename = "deis")]
    Deis,
}

/// Every sampler knob, grouped by the sampler families that read it.
///
/// Samplers ignore fields outside their family; the record is carried whole so
/// it round-trips unchanged. `s_tmax == 0.0` means unbounded, see [`SchedulerOptions::normalized`].
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerOptions {
    pub num_train_timesteps: usize,
    pub steps_offset: usize,

    // timestep
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    pub prediction_type: PredictionType,
    pub variance_type: Option<VarianceType>,
    pub timestep_spacing: TimestepSpacing,

    // clipping
    pub clip_sample: bool,
    pub clip_sample_range: f64,

    // thresholding
    pub thresholding: bool,
    pub dynamic_thresholding_ratio: f64,
    pub sample_max_value: f64,

    // karras
    pub use_karras_sigmas: bool,
    pub sigma_min: Option<f64>,
    pub sigma_max: Option<f64>,
    pub rho: f64,

    // multistep
    pub solver_order: usize,
    pub solver_type: SolverType,
    pub algorithm_type: AlgorithmType,
    pub lower_order_final: bool,

    // stochastic
    pub eta: f64,
    pub s_noise: f64,
    pub s_churn: f64,
    pub s_tmin: f64,
    pub s_tmax: f64,

    // flow match
    pub shift: f64,
    pub use_dynamic_shifting: bool,
    pub base_shift: f64,
    pub max_shift: f64,
    pub stochastic_sampling: bool,
    pub flow_shift: f64,
    pub base_image_seq_len: usize,
    pub max_image_seq_len: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            steps_offset: 0,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            prediction_type: PredictionType::Epsilon,
            variance_type: None,
            timestep_spacing: TimestepSpacing::Linspace,
            clip_sample: false,
            clip_sample_range: 1.0,
            thresholding: false,
            dynamic_thresholding_ratio: 0.995,
            sample_max_value: 1.0,
            use_karras_sigmas: false,
            sigma_min: None,
            sigma_max: None,
            rho: 7.0,
            solver_order: 2,
            solver_type: SolverType::Midpoint,
            algorithm_type: AlgorithmType::DpmSolverPlusPlus,
            lower_order_final: true,
            eta: 0.0,
            s_noise: 1.0,
            s_churn: 0.0,
            s_tmin: 0.0,
            s_tmax: 0.0,
            shift: 1.0,
            use_dynamic_shifting: false,
            base_shift: 0.5,
            max_shift: 1.15,
            stochastic_sampling: false,
            flow_shift: 1.0,
            base_image_seq_len: 256,
            max_image_seq_len: 4096,
        }
    }
}

impl SchedulerOptions {
    /// Copy with the `s_tmax` sentinel (`0.0`, or anything non-positive) replaced by `+inf`.
    pub fn normalized(&self) -> Self {
        let mut out = self.clone();
        if out.s_tmax <= 0.0 {
            out.s_tmax = f64::INFINITY;
        }
        out
    }

    /// `self` laid over `base`. Unset optional fields keep the base value.
    pub fn merged_over(&self, base: &Self) -> Self {
        Self {
            variance_type: self.variance_type.or(base.variance_type),
            sigma_min: self.sigma_min.or(base.sigma_min),
            sigma_max: self.sigma_max.or(base.sigma_max),
            ..self.clone()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SamplerKind {
    Ddim,
    Ddpm,
    Lms,
    Euler,
    EulerAncestral,
    Kdpm2,
    Kdpm2Ancestral,
    DdpmWuerstchen,
    Lcm,
    FlowMatchEulerDiscrete,
    FlowMatchHeunDiscrete,
    Pndm,
    Heun,
    UniPc,
    DpmMultistep,
    DpmMultistepInverse,
    DpmSinglestep,
    DpmSde,
    Deis,
    Edm,
    EdmMultistep,
    FlowMatchLcm,
    Ipndm,
}

impl SamplerKind {
    pub const ALL: [SamplerKind; 23] = [
        Self::Ddim,
        Self::Ddpm,
        Self::Lms,
        Self::Euler,
        Self::EulerAncestral,
        Self::Kdpm2,
        Self::Kdpm2Ancestral,
        Self::DdpmWuerstchen,
        Self::Lcm,
        Self::FlowMatchEulerDiscrete,
        Self::FlowMatchHeunDiscrete,
        Self::Pndm,
        Self::Heun,
        Self::UniPc,
        Self::DpmMultistep,
        Self::DpmMultistepInverse,
        Self::DpmSinglestep,
        Self::DpmSde,
        Self::Deis,
        Self::Edm,
        Self::EdmMultistep,
        Self::FlowMatchLcm,
        Self::Ipndm,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ddim => "ddim",
            Self::Ddpm => "ddpm",
            Self::Lms => "lms",
            Self::Euler => "euler",
            Self::EulerAncestral => "eulerancestral",
            Self::Kdpm2 => "kdpm2",
            Self::Kdpm2Ancestral => "kdpm2ancestral",
            Self::DdpmWuerstchen => "ddpmwuerstchen",
            Self::Lcm => "lcm",
            Self::FlowMatchEulerDiscrete => "flowmatcheulerdiscrete",
            Self::FlowMatchHeunDiscrete => "flowmatchheundiscrete",
            Self::Pndm => "pndm",
            Self::Heun => "heun",
            Self::UniPc => "unipc",
            Self::DpmMultistep => "dpmm",
            Self::DpmMultistepInverse => "dpmminverse",
            Self::DpmSinglestep => "dpms",
            Self::DpmSde => "dpmsde",
            Self::Deis => "deism",
            Self::Edm => "edm",
            Self::EdmMultistep => "edmm",
            Self::FlowMatchLcm => "flowmatchlcm",
            Self::Ipndm => "ipndm",
        }
    }

    pub fn is_flow_match(&self) -> bool {
        matches!(
            self,
            Self::FlowMatchEulerDiscrete | Self::FlowMatchHeunDiscrete | Self::FlowMatchLcm
        )
    }
}

impl FromStr for SamplerKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == wanted)
            .ok_or_else(|| EngineError::UnknownScheduler(s.to_string()))
    }
}

impl Display for SamplerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A sampler selection: which algorithm plus its normalized options.
#[derive(Clone, Debug, PartialEq)]
pub struct Sampler {
    kind: SamplerKind,
    options: SchedulerOptions,
}

fn time_shift(mu: f64, sigma: f64, t: f64) -> f64 {
    let e = mu.exp();
    e / (e + (1. / t - 1.).powf(sigma))
}

pub fn calculate_shift(
    image_seq_len: usize,
    base_seq_len: usize,
    max_seq_len: usize,
    base_shift: f64,
    max_shift: f64,
) -> f64 {
    let m = (max_shift - base_shift) / (max_seq_len - base_seq_len) as f64;
    let b = base_shift - m * base_seq_len as f64;
    image_seq_len as f64 * m + b
}

impl Sampler {
    pub fn new(kind: SamplerKind, options: &SchedulerOptions) -> Self {
        Self {
            kind,
            options: options.normalized(),
        }
    }

    /// Build from a requested name, with `options` laid over the current sampler's options.
    pub fn from_request(name: &str, options: &SchedulerOptions, base: &Sampler) -> Result<Self> {
        let kind = name.parse::<SamplerKind>()?;
        Ok(Self::new(kind, &options.merged_over(&base.options)))
    }

    pub fn kind(&self) -> SamplerKind {
        self.kind
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Timestep schedule of `num_steps + 1` points, descending.
    ///
    /// Flow-match samplers return sigmas in `[0, 1]`, shifted statically or, with dynamic
    /// shifting, by the image sequence length. Others return training timesteps spaced per
    /// `timestep_spacing`, ending at `0`.
    pub fn timesteps(&self, num_steps: usize, image_seq_len: usize) -> Vec<f64> {
        if num_steps == 0 {
            return Vec::new();
        }
        let o = &self.options;
        if self.kind.is_flow_match() {
            let sigmas = (0..=num_steps).map(|v| v as f64 / num_steps as f64).rev();
            if o.use_dynamic_shifting && o.max_image_seq_len > o.base_image_seq_len {
                let mu = calculate_shift(
                    image_seq_len,
                    o.base_image_seq_len,
                    o.max_image_seq_len,
                    o.base_shift,
                    o.max_shift,
                );
                return sigmas
                    .map(|s| if s > 0. { time_shift(mu, 1., s) } else { 0. })
                    .collect();
            }
            return sigmas
                .map(|s| o.shift * s / (1. + (o.shift - 1.) * s))
                .collect();
        }

        let t = o.num_train_timesteps.max(1) as f64;
        let n = num_steps as f64;
        let mut steps: Vec<f64> = match o.timestep_spacing {
            TimestepSpacing::Linspace => (0..num_steps)
                .map(|i| {
                    if num_steps == 1 {
                        0.
                    } else {
                        (i as f64 * (t - 1.) / (n - 1.)).round()
                    }
                })
                .rev()
                .collect(),
            TimestepSpacing::Leading => {
                let ratio = (t / n).floor().max(1.);
                (0..num_steps)
                    .map(|i| (i as f64 * ratio).round() + o.steps_offset as f64)
                    .rev()
                    .collect()
            }
            TimestepSpacing::Trailing => {
                let ratio = t / n;
                (0..num_steps)
                    .map(|i| ((t - i as f64 * ratio).round() - 1.).max(0.))
                    .collect()
            }
        };
        steps.push(0.);
        steps
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new(SamplerKind::Ddim, &SchedulerOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Sampler, SamplerKind, SchedulerOptions, TimestepSpacing};
    use crate::error::ErrorKind;

    #[test]
    fn s_tmax_zero_means_unbounded() {
        let opts = SchedulerOptions::default();
        assert_eq!(opts.normalized().s_tmax, f64::INFINITY);

        let opts = SchedulerOptions {
            s_tmax: 12.5,
            eta: 0.3,
            ..Default::default()
        };
        assert_eq!(opts.normalized(), opts);
    }

    #[test]
    fn options_round_trip_through_payloads() {
        let opts = SchedulerOptions {
            beta_schedule: super::BetaSchedule::SquaredCosCapV2,
            algorithm_type: super::AlgorithmType::SdeDpmSolverPlusPlus,
            sigma_min: Some(0.03),
            s_tmax: 3.0,
            use_karras_sigmas: true,
            ..Default::default()
        };
        let value = serde_json::to_value(&opts).unwrap();
        assert_eq!(value["algorithm_type"], json!("sde-dpmsolver++"));
        assert_eq!(value["beta_schedule"], json!("squaredcos_cap_v2"));
        let back: SchedulerOptions = serde_json::from_value(value).unwrap();
        assert_eq!(back, opts);
    }

    #[test]
    fn unknown_option_values_are_rejected() {
        let err = serde_json::from_value::<SchedulerOptions>(json!({"solver_type": "rk4"}));
        assert!(err.is_err());
    }

    #[test]
    fn all_sampler_names_resolve_case_insensitively() {
        for kind in SamplerKind::ALL {
            assert_eq!(kind.name().parse::<SamplerKind>().unwrap(), kind);
            assert_eq!(kind.name().to_uppercase().parse::<SamplerKind>().unwrap(), kind);
        }
        let err = "karras".parse::<SamplerKind>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownSchedulerError);
    }

    #[test]
    fn request_options_override_base_except_unset() {
        let base = Sampler::new(
            SamplerKind::FlowMatchEulerDiscrete,
            &SchedulerOptions {
                sigma_min: Some(0.1),
                shift: 3.0,
                ..Default::default()
            },
        );
        let request = SchedulerOptions {
            shift: 5.0,
            ..Default::default()
        };
        let sampler = Sampler::from_request("Euler", &request, &base).unwrap();
        assert_eq!(sampler.kind(), SamplerKind::Euler);
        assert_eq!(sampler.options().shift, 5.0);
        assert_eq!(sampler.options().sigma_min, Some(0.1));
        assert_eq!(sampler.options().s_tmax, f64::INFINITY);
    }

    #[test]
    fn flow_match_schedule_is_shifted_and_descending() {
        let sampler = Sampler::new(
            SamplerKind::FlowMatchEulerDiscrete,
            &SchedulerOptions {
                shift: 3.0,
                ..Default::default()
            },
        );
        let ts = sampler.timesteps(4, 4096);
        assert_eq!(ts.len(), 5);
        assert_eq!(ts[0], 1.0);
        assert_eq!(ts[4], 0.0);
        assert!(ts.windows(2).all(|w| w[0] > w[1]));
        // shift > 1 keeps sigmas above the linear schedule
        assert!(ts[2] > 0.5);
    }

    #[test]
    fn discrete_spacings() {
        let mut opts = SchedulerOptions::default();
        let ts = Sampler::new(SamplerKind::Ddim, &opts).timesteps(4, 0);
        assert_eq!(ts, vec![999., 666., 333., 0., 0.]);

        opts.timestep_spacing = TimestepSpacing::Leading;
        opts.steps_offset = 1;
        let ts = Sampler::new(SamplerKind::Ddim, &opts).timesteps(4, 0);
        assert_eq!(ts, vec![751., 501., 251., 1., 0.]);

        opts.timestep_spacing = TimestepSpacing::Trailing;
        let ts = Sampler::new(SamplerKind::Ddim, &opts).timesteps(4, 0);
        assert_eq!(ts, vec![999., 749., 499., 249., 0.]);
    }
}
