//! Closed tables describing what each pipeline family loads and which process types it runs.

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Deserializer};

use crate::error::EngineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineFamily {
    Flux,
    Flux2,
    Chroma,
    QwenImage,
    ZImage,
    StableDiffusionXL,
    Kandinsky5,
    CogVideoX,
    Wan,
    LTX,
    LTX2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessType {
    TextToImage,
    ImageToImage,
    ImageEdit,
    TextToVideo,
    ImageToVideo,
    VideoToVideo,
    ControlNetImage,
    ControlNetImageToImage,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentName {
    TextEncoder(usize),
    Transformer(usize),
    Unet,
    Vae,
    AudioVae,
    ControlNet,
}

impl Display for ComponentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TextEncoder(1) => write!(f, "text_encoder"),
            Self::TextEncoder(x) => write!(f, "text_encoder_{x}"),
            Self::Transformer(1) => write!(f, "transformer"),
            Self::Transformer(x) => write!(f, "transformer_{x}"),
            Self::Unet => write!(f, "unet"),
            Self::Vae => write!(f, "vae"),
            Self::AudioVae => write!(f, "audio_vae"),
            Self::ControlNet => write!(f, "control_net"),
        }
    }
}

/// What a sub-model does in the pipeline. Drives checkpoint lookup and quantization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComponentRole {
    TextEncoder,
    Denoiser,
    Autoencoder,
    SecondaryAutoencoder,
    ControlNet,
}

impl ComponentName {
    pub fn role(&self) -> ComponentRole {
        match self {
            Self::TextEncoder(_) => ComponentRole::TextEncoder,
            Self::Transformer(_) | Self::Unet => ComponentRole::Denoiser,
            Self::Vae => ComponentRole::Autoencoder,
            Self::AudioVae => ComponentRole::SecondaryAutoencoder,
            Self::ControlNet => ComponentRole::ControlNet,
        }
    }

    /// Repository subfolder holding this sub-model.
    pub fn subfolder(&self) -> Option<String> {
        match self {
            Self::ControlNet => None,
            other => Some(other.to_string()),
        }
    }
}

impl ComponentRole {
    /// Autoencoders and control-nets always load at the pipeline precision.
    pub fn is_quantizable(&self) -> bool {
        matches!(self, Self::TextEncoder | Self::Denoiser)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromptCachePolicy {
    /// Encode on every call.
    Off,
    /// Keyed by `(prompt, negative_prompt)`.
    Prompts,
    /// Keyed by `(prompt, negative_prompt, guidance_scale > 1)`.
    PromptsAndGuidance,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputKind {
    /// `(batch, height, width, channel)` from the runtime.
    Image,
    /// `(batch, frames, height, width, channel)` from the runtime.
    Video,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessCapabilities {
    pub image_input: bool,
    pub strength: bool,
    pub control_images: bool,
    pub output: OutputKind,
}

#[derive(Debug)]
pub struct FamilyDescriptor {
    /// Load order; the index in this list is the progress model index.
    pub components: &'static [ComponentName],
    pub process_types: &'static [ProcessType],
    pub prompt_cache: PromptCachePolicy,
    pub control_net: bool,
}

use ComponentName::*;
use ProcessType::*;

const T1: ComponentName = TextEncoder(1);
const T2: ComponentName = TextEncoder(2);
const X1: ComponentName = Transformer(1);
const X2: ComponentName = Transformer(2);

static FLUX: FamilyDescriptor = FamilyDescriptor {
    components: &[T1, T2, X1, Vae],
    process_types: &[TextToImage, ImageToImage, ControlNetImage],
    prompt_cache: PromptCachePolicy::Off,
    control_net: true,
};

static FLUX2: FamilyDescriptor = FamilyDescriptor {
    components: &[T1, X1, Vae],
    process_types: &[TextToImage, ImageToImage],
    prompt_cache: PromptCachePolicy::Off,
    control_net: false,
};

static CHROMA: FamilyDescriptor = FamilyDescriptor {
    components: &[T1, X1, Vae],
    process_types: &[TextToImage, ImageToImage],
    prompt_cache: PromptCachePolicy::Off,
    control_net: false,
};

static QWEN_IMAGE: FamilyDescriptor = FamilyDescriptor {
    components: &[T1, X1, Vae],
    process_types: &[TextToImage, ImageToImage, ImageEdit, ControlNetImage],
    prompt_cache: PromptCachePolicy::Off,
    control_net: true,
};

static Z_IMAGE: FamilyDescriptor = FamilyDescriptor {
    components: &[T1, X1, Vae],
    process_types: &[TextToImage, ImageToImage],
    prompt_cache: PromptCachePolicy::Prompts,
    control_net: false,
};

static SDXL: FamilyDescriptor = FamilyDescriptor {
    components: &[T1, T2, Unet, Vae],
    process_types: &[
        TextToImage,
        ImageToImage,
        ControlNetImage,
        ControlNetImageToImage,
    ],
    prompt_cache: PromptCachePolicy::Prompts,
    control_net: true,
};

static KANDINSKY5: FamilyDescriptor = FamilyDescriptor {
    components: &[T1, T2, X1, Vae],
    process_types: &[TextToImage, ImageEdit, TextToVideo, ImageToVideo],
    prompt_cache: PromptCachePolicy::Off,
    control_net: false,
};

static COGVIDEOX: FamilyDescriptor = FamilyDescriptor {
    components: &[T1, X1, Vae],
    process_types: &[TextToVideo, ImageToVideo, VideoToVideo],
    prompt_cache: PromptCachePolicy::Prompts,
    control_net: false,
};

static WAN: FamilyDescriptor = FamilyDescriptor {
    components: &[T1, X1, X2, Vae],
    process_types: &[TextToVideo, ImageToVideo],
    prompt_cache: PromptCachePolicy::Off,
    control_net: false,
};

static LTX_VIDEO: FamilyDescriptor = FamilyDescriptor {
    components: &[T1, X1, Vae],
    process_types: &[TextToVideo, ImageToVideo],
    prompt_cache: PromptCachePolicy::Off,
    control_net: false,
};

static LTX2_VIDEO: FamilyDescriptor = FamilyDescriptor {
    components: &[T1, X1, Vae, AudioVae],
    process_types: &[TextToVideo, ImageToVideo],
    prompt_cache: PromptCachePolicy::PromptsAndGuidance,
    control_net: false,
};

impl PipelineFamily {
    pub fn descriptor(&self) -> &'static FamilyDescriptor {
        match self {
            Self::Flux => &FLUX,
            Self::Flux2 => &FLUX2,
            Self::Chroma => &CHROMA,
            Self::QwenImage => &QWEN_IMAGE,
            Self::ZImage => &Z_IMAGE,
            Self::StableDiffusionXL => &SDXL,
            Self::Kandinsky5 => &KANDINSKY5,
            Self::CogVideoX => &COGVIDEOX,
            Self::Wan => &WAN,
            Self::LTX => &LTX_VIDEO,
            Self::LTX2 => &LTX2_VIDEO,
        }
    }

    pub fn supports(&self, process_type: ProcessType) -> bool {
        self.descriptor().process_types.contains(&process_type)
    }

    /// Models tracked for progress: every component plus an optional control-net.
    pub fn total_models(&self, with_control_net: bool) -> usize {
        self.descriptor().components.len() + usize::from(with_control_net)
    }
}

impl ProcessType {
    pub const fn capabilities(&self) -> ProcessCapabilities {
        let (image_input, strength, control_images, output) = match self {
            TextToImage => (false, false, false, OutputKind::Image),
            ImageToImage => (true, true, false, OutputKind::Image),
            ImageEdit => (true, false, false, OutputKind::Image),
            TextToVideo => (false, false, false, OutputKind::Video),
            ImageToVideo => (true, false, false, OutputKind::Video),
            VideoToVideo => (true, true, false, OutputKind::Video),
            ControlNetImage => (false, false, true, OutputKind::Image),
            ControlNetImageToImage => (true, true, true, OutputKind::Image),
        };
        ProcessCapabilities {
            image_input,
            strength,
            control_images,
            output,
        }
    }
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = EngineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Self::$variant),)+
                    other => Err(EngineError::Configuration(format!(
                        concat!("unknown ", stringify!($ty), " `{}`"),
                        other
                    ))),
                }
            }
        }

        impl Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(Self::$variant => write!(f, $name),)+
                }
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_enum!(PipelineFamily {
    Flux => "Flux",
    Flux2 => "Flux2",
    Chroma => "Chroma",
    QwenImage => "QwenImage",
    ZImage => "ZImage",
    StableDiffusionXL => "StableDiffusionXL",
    Kandinsky5 => "Kandinsky5",
    CogVideoX => "CogVideoX",
    Wan => "Wan",
    LTX => "LTX",
    LTX2 => "LTX2",
});

string_enum!(ProcessType {
    TextToImage => "TextToImage",
    ImageToImage => "ImageToImage",
    ImageEdit => "ImageEdit",
    TextToVideo => "TextToVideo",
    ImageToVideo => "ImageToVideo",
    VideoToVideo => "VideoToVideo",
    ControlNetImage => "ControlNetImage",
    ControlNetImageToImage => "ControlNetImageToImage",
});
