use common::{config::ConfigError, ConfigDecoder, Error, Result, Shoot};
use tracing::debug;

/// Validates the provider config of this extension inside `Shoot` resources
#[derive(Clone, Debug)]
pub struct ShootValidator {
    extension_type: String,
    decoder: ConfigDecoder,
}

impl ShootValidator {
    pub fn new(extension_type: &str, decoder: ConfigDecoder) -> Result<Self> {
        if extension_type.is_empty() {
            return Err(Error::InvalidValidator("extension type is empty".into()));
        }
        if decoder.versions().is_empty() {
            return Err(Error::InvalidValidator("decoder knows no config version".into()));
        }
        Ok(Self {
            extension_type: extension_type.to_string(),
            decoder,
        })
    }

    #[must_use]
    pub fn extension_type(&self) -> &str {
        &self.extension_type
    }

    /// Check the shoot about to be persisted; the previous version is not looked at
    pub fn validate(&self, new: &Shoot, _old: Option<&Shoot>) -> Result<()> {
        let ext = new
            .extension(&self.extension_type)
            .ok_or_else(|| Error::ExtensionNotFound(self.extension_type.clone()))?;
        if ext.is_disabled() {
            debug!("extension {} is disabled, accepting", self.extension_type);
            return Ok(());
        }
        let raw = ext
            .provider_config
            .as_ref()
            .ok_or_else(|| Error::InvalidExtensionConfig(ConfigError::Missing))?;
        self.decoder
            .decode_and_validate(raw)
            .map_err(Error::InvalidExtensionConfig)?;
        Ok(())
    }
}
