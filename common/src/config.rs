use std::collections::BTreeMap;
use std::env;

use serde_json::Value;

use crate::error::ConfigError;
use crate::job::MAX_FAILOVER_ATTEMPTS_ATTR;

pub const DEFAULT_MAX_FAILOVER_ATTEMPTS: u32 = 5;

/// Configuración del coordinador de failover.
///
/// `max_failover_attempts` tiene que ser el mismo en todos los nodos del
/// cluster; el master lo comprueba cuando se registra un worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverConfig {
    max_failover_attempts: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_failover_attempts: DEFAULT_MAX_FAILOVER_ATTEMPTS,
        }
    }
}

impl FailoverConfig {
    /// Valores negativos se rechazan al arrancar.
    pub fn new(max_failover_attempts: i64) -> Result<Self, ConfigError> {
        if max_failover_attempts < 0 {
            return Err(ConfigError::NegativeMaxFailoverAttempts(
                max_failover_attempts,
            ));
        }
        let max = u32::try_from(max_failover_attempts).map_err(|_| ConfigError::Invalid {
            name: "MAX_FAILOVER_ATTEMPTS".to_string(),
            value: max_failover_attempts.to_string(),
        })?;
        Ok(Self {
            max_failover_attempts: max,
        })
    }

    /// Lee MAX_FAILOVER_ATTEMPTS; si no está definida usa el default (5).
    pub fn from_env() -> Result<Self, ConfigError> {
        match env::var("MAX_FAILOVER_ATTEMPTS") {
            Ok(raw) => Self::parse(&raw),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let value = raw.trim().parse::<i64>().map_err(|_| ConfigError::Invalid {
            name: "MAX_FAILOVER_ATTEMPTS".to_string(),
            value: raw.to_string(),
        })?;
        Self::new(value)
    }

    pub fn max_failover_attempts(&self) -> u32 {
        self.max_failover_attempts
    }

    /// Atributos que el nodo publica y que deben coincidir en todo el cluster.
    pub fn node_attributes(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([(
            MAX_FAILOVER_ATTEMPTS_ATTR.to_string(),
            Value::from(self.max_failover_attempts),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_es_cinco_intentos() {
        assert_eq!(FailoverConfig::default().max_failover_attempts(), 5);
    }

    #[test]
    fn rechaza_valores_negativos() {
        assert_eq!(
            FailoverConfig::new(-1),
            Err(ConfigError::NegativeMaxFailoverAttempts(-1))
        );
    }

    #[test]
    fn acepta_cero_intentos() {
        let cfg = FailoverConfig::new(0).unwrap();
        assert_eq!(cfg.max_failover_attempts(), 0);
    }

    #[test]
    fn parse_rechaza_texto_no_numerico() {
        let err = FailoverConfig::parse("muchos").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn parse_recorta_espacios() {
        assert_eq!(FailoverConfig::parse(" 7 ").unwrap().max_failover_attempts(), 7);
    }
}
