//! Configuration validation logic.

use crate::config::schema::ProfileConfig;

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validate a merged ProfileConfig for semantic correctness.
pub fn validate_config(cfg: &ProfileConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if cfg.max_total_conns == 0 {
        errors.push(ValidationError("max_total_conns must be > 0".to_string()));
    }
    if cfg.attempt_refill_per_sec <= 0.0 {
        errors.push(ValidationError(
            "attempt_refill_per_sec must be > 0".to_string(),
        ));
    }
    if cfg.max_live_conns_per_ip == 0 {
        errors.push(ValidationError(
            "max_live_conns_per_ip must be > 0".to_string(),
        ));
    }
    if cfg.attempt_burst < 1.0 {
        errors.push(ValidationError("attempt_burst must be >= 1".to_string()));
    }
    if cfg.denies_before_tempblock == 0 {
        errors.push(ValidationError(
            "denies_before_tempblock must be >= 1".to_string(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::Profile;

    #[test]
    fn defaults_are_valid() {
        assert!(validate_config(&ProfileConfig::defaults_for(Profile::Login)).is_ok());
        assert!(validate_config(&ProfileConfig::defaults_for(Profile::Game)).is_ok());
    }

    #[test]
    fn zero_total_conns_rejected() {
        let mut cfg = ProfileConfig::login_defaults();
        cfg.max_total_conns = 0;
        let errs = validate_config(&cfg).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert!(errs[0].0.contains("max_total_conns"));
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = ProfileConfig::game_defaults();
        cfg.max_total_conns = 0;
        cfg.attempt_refill_per_sec = 0.0;
        cfg.max_live_conns_per_ip = 0;
        let errs = validate_config(&cfg).unwrap_err();
        assert_eq!(errs.len(), 3);
    }
}
