pub mod audio;
pub mod coordinator;
pub mod device;
pub mod messages;
pub mod net;
pub mod speech;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CompaniaError {
    #[error("Audio device error: {0}")]
    AudioDeviceError(String),

    #[error("Recognizer error: {0}")]
    RecognizerError(String),

    #[error("Recognizer unavailable: {0}")]
    RecognizerUnavailable(String),

    #[error("Synthesizer error: {0}")]
    SynthesizerError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),
}

impl From<std::io::Error> for CompaniaError {
    fn from(e: std::io::Error) -> Self {
        CompaniaError::StorageError(e.to_string())
    }
}

impl CompaniaError {
    /// Whether the affected feature should retry after this error.
    ///
    /// Non-recoverable errors disable their feature once; recoverable ones
    /// are retried with a fixed delay and never surfaced past a log line.
    pub fn is_recoverable(&self) -> bool {
        match self {
            // No microphone or no recognizer support disables the feature
            CompaniaError::AudioDeviceError(_) => false,
            CompaniaError::RecognizerUnavailable(_) => false,
            // Transient: restart/reconnect with a fixed delay
            CompaniaError::RecognizerError(_) => true,
            CompaniaError::SynthesizerError(_) => true,
            CompaniaError::ConnectionError(_) => true,
            CompaniaError::ApiError(_) => true,
            CompaniaError::StorageError(_) => false,
            CompaniaError::ConfigError(_) => false,
            CompaniaError::ChannelError(_) => false,
        }
    }

    /// Spoken/displayed text for the few failures the user ever sees.
    pub fn user_message(&self) -> String {
        match self {
            CompaniaError::AudioDeviceError(_) => {
                "No he podido acceder al micrófono. Revisa los permisos.".to_string()
            }
            CompaniaError::RecognizerError(_) | CompaniaError::RecognizerUnavailable(_) => {
                "No he podido escucharte ahora. Inténtalo de nuevo.".to_string()
            }
            CompaniaError::SynthesizerError(_) => {
                "No he podido leerte el mensaje en voz alta.".to_string()
            }
            CompaniaError::ConnectionError(_) => {
                "He perdido la conexión. Reintentando...".to_string()
            }
            CompaniaError::ApiError(_) => {
                "No he podido recuperar tus datos ahora.".to_string()
            }
            CompaniaError::StorageError(_) => {
                "No he podido guardar tus datos en este dispositivo.".to_string()
            }
            CompaniaError::ConfigError(_) => {
                "Hay un problema de configuración. Revisa los ajustes.".to_string()
            }
            CompaniaError::ChannelError(_) => {
                "Ha ocurrido un error interno. Reinicia la aplicación.".to_string()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, CompaniaError>;
