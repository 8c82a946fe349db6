use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use crate::error::Error;

/// Noise schedulers understood by the sampling pipelines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Scheduler {
    EulerAncestral,
    Euler,
    Dpm2,
    Dpm2Ancestral,
    Lms,
    Ddim,
    DpmPlusPlus2M,
    Pndm,
}

impl Scheduler {
    /// Scheduler ID as stored in settings and image metadata
    pub fn id(&self) -> &'static str {
        match self {
            Self::EulerAncestral => "k_euler_a",
            Self::Euler => "k_euler",
            Self::Dpm2 => "k_dpm_2",
            Self::Dpm2Ancestral => "k_dpm_2_a",
            Self::Lms => "k_lms",
            Self::Ddim => "ddim",
            Self::DpmPlusPlus2M => "dpm++_2m",
            Self::Pndm => "pndm",
        }
    }

    /// Name for display
    pub fn name(&self) -> &'static str {
        match self {
            Self::EulerAncestral => "Euler Ancestral",
            Self::Euler => "Euler",
            Self::Dpm2 => "DPM2",
            Self::Dpm2Ancestral => "DPM2 Ancestral",
            Self::Lms => "LMS",
            Self::Ddim => "DDIM",
            Self::DpmPlusPlus2M => "DPM++ 2M",
            Self::Pndm => "PNDM",
        }
    }

    pub fn all() -> [Scheduler; 8] {
        [
            Self::EulerAncestral,
            Self::Euler,
            Self::Dpm2,
            Self::Dpm2Ancestral,
            Self::Lms,
            Self::Ddim,
            Self::DpmPlusPlus2M,
            Self::Pndm,
        ]
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::EulerAncestral
    }
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Scheduler {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .into_iter()
            .find(|scheduler| scheduler.id() == s)
            .ok_or_else(|| Error::Metadata(format!("unknown scheduler '{}'", s)))
    }
}

impl From<Scheduler> for String {
    fn from(scheduler: Scheduler) -> Self {
        scheduler.id().to_string()
    }
}

impl TryFrom<String> for Scheduler {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Structural kind of a loaded pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineKind {
    Txt2Img,
    Img2Img,
    ControlNet { model: String },
}

impl PipelineKind {
    pub fn name(&self) -> &str {
        match self {
            Self::Txt2Img => "txt2img",
            Self::Img2Img => "img2img",
            Self::ControlNet { .. } => "controlnet",
        }
    }
}

/// Identifies a loaded pipeline. Two requests with equal fingerprints can
/// share one pipeline instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub model: String,
    pub kind: PipelineKind,
}

impl Fingerprint {
    pub fn new(model: impl Into<String>, kind: PipelineKind) -> Self {
        Self {
            model: model.into(),
            kind,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            PipelineKind::ControlNet { model } => {
                write!(f, "{}+{}:{}", self.model, self.kind.name(), model)
            }
            kind => write!(f, "{}:{}", self.model, kind.name()),
        }
    }
}
