use thiserror::Error;

/// Failures acquiring or driving an audio device.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("No {0} device available")]
    NoDevice(&'static str),

    #[error("Unsupported device configuration: {0}")]
    Unsupported(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Microphone is not armed")]
    NotArmed,

    #[error("Resampler error: {0}")]
    Resampler(String),
}

impl From<cpal::SupportedStreamConfigsError> for DeviceError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        DeviceError::Unsupported(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for DeviceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        DeviceError::Unsupported(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for DeviceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        DeviceError::Stream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for DeviceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        DeviceError::Stream(err.to_string())
    }
}

impl From<rubato::ResamplerConstructionError> for DeviceError {
    fn from(err: rubato::ResamplerConstructionError) -> Self {
        DeviceError::Resampler(err.to_string())
    }
}
