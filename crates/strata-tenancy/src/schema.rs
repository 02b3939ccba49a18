use regex::Regex;

use strata_core::config::TenancyConfig;
use strata_core::error::{Result, StrataError};

/// Maps tenant ids to schema names.
#[derive(Debug, Clone)]
pub struct SchemaNaming {
    prefix: String,
    case_sensitive: bool,
    pattern: Regex,
}

impl SchemaNaming {
    pub fn new(prefix: &str, case_sensitive: bool, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| StrataError::Configuration(format!("tenant_id_pattern: {}", e)))?;
        if !is_identifier(prefix) && !prefix.is_empty() {
            return Err(StrataError::Configuration(format!(
                "schema_prefix '{}' may only contain letters, digits, and '_'",
                prefix
            )));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            case_sensitive,
            pattern,
        })
    }

    pub fn from_config(config: &TenancyConfig) -> Result<Self> {
        Self::new(
            &config.schema_prefix,
            config.case_sensitive,
            &config.tenant_id_pattern,
        )
    }

    pub fn validate_tenant_id(&self, tenant_id: &str) -> Result<()> {
        if tenant_id.is_empty() || !self.pattern.is_match(tenant_id) || !is_identifier(tenant_id) {
            return Err(StrataError::InvalidTenantId(tenant_id.to_string()));
        }
        Ok(())
    }

    /// Deterministic schema name for a tenant.
    pub fn schema_name(&self, tenant_id: &str) -> Result<String> {
        self.validate_tenant_id(tenant_id)?;
        let name = format!("{}{}", self.prefix, tenant_id);
        Ok(if self.case_sensitive {
            name
        } else {
            name.to_lowercase()
        })
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
