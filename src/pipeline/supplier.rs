//! Supplier resolution stage. Never fails.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::pipeline::types::{ExtractionResult, SupplierRecord};
use crate::store::SupplierDirectory;

pub struct SupplierResolver {
    directory: Arc<dyn SupplierDirectory>,
}

impl SupplierResolver {
    pub fn new(directory: Arc<dyn SupplierDirectory>) -> Self {
        Self { directory }
    }

    /// Domain lookup, then name scan, then the unknown-vendor record.
    ///
    /// Directory errors are logged and count as a miss.
    pub async fn resolve(&self, extraction: &ExtractionResult) -> SupplierRecord {
        let domain = extraction.sender_domain.trim();

        if !domain.is_empty() {
            match self.directory.find_by_domain(domain).await {
                Ok(Some(record)) => {
                    info!(domain, supplier_id = %record.supplier_id, "Supplier resolved by domain");
                    return record;
                }
                Ok(None) => debug!(domain, "No supplier for domain"),
                Err(e) => warn!(domain, error = %e, "Supplier domain lookup failed"),
            }
        }

        if let Some(name) = extraction
            .supplier_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
        {
            match self.directory.find_by_name(name).await {
                Ok(Some(record)) => {
                    info!(name, supplier_id = %record.supplier_id, "Supplier resolved by name");
                    return record;
                }
                Ok(None) => debug!(name, "No supplier for name"),
                Err(e) => warn!(name, error = %e, "Supplier name scan failed"),
            }
        }

        info!(domain, "Supplier not found, using unknown vendor");
        SupplierRecord::unknown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;

    use crate::error::DatabaseError;
    use crate::pipeline::types::{RoutingCode, SupplierType, UNKNOWN_VENDOR_ID};

    struct MockDirectory {
        by_domain: HashMap<String, SupplierRecord>,
        fail: bool,
    }

    #[async_trait]
    impl SupplierDirectory for MockDirectory {
        async fn find_by_domain(&self, domain: &str) -> Result<Option<SupplierRecord>, DatabaseError> {
            if self.fail {
                return Err(DatabaseError::Query("connection reset".into()));
            }
            Ok(self.by_domain.get(domain).cloned())
        }

        async fn find_by_name(&self, name: &str) -> Result<Option<SupplierRecord>, DatabaseError> {
            if self.fail {
                return Err(DatabaseError::Query("connection reset".into()));
            }
            let needle = name.to_lowercase();
            Ok(self
                .by_domain
                .values()
                .find(|r| {
                    r.supplier_name
                        .as_deref()
                        .is_some_and(|n| n.to_lowercase().contains(&needle))
                })
                .cloned())
        }
    }

    fn acme() -> SupplierRecord {
        SupplierRecord {
            supplier_id: "V12345".into(),
            supplier_name: Some("Acme Industrial Supplies".into()),
            supplier_type: SupplierType::Standard,
            routing_code: RoutingCode::ApInbox,
            default_currency: None,
            unknown_vendor: false,
        }
    }

    fn resolver(fail: bool) -> SupplierResolver {
        let mut by_domain = HashMap::new();
        by_domain.insert("acme.com".to_string(), acme());
        SupplierResolver::new(Arc::new(MockDirectory { by_domain, fail }))
    }

    fn extraction(domain: &str, supplier_name: Option<&str>) -> ExtractionResult {
        ExtractionResult {
            sender_address: format!("billing@{domain}"),
            sender_domain: domain.into(),
            recipient_address: "invoices@corp.com".into(),
            subject: "Invoice".into(),
            supplier_name: supplier_name.map(String::from),
            invoices: vec![],
            po_numbers: vec![],
            body_text: String::new(),
            attachments: vec![],
        }
    }

    #[tokio::test]
    async fn resolves_by_domain() {
        let record = resolver(false).resolve(&extraction("acme.com", None)).await;
        assert_eq!(record.supplier_id, "V12345");
        assert!(!record.unknown_vendor);
    }

    #[tokio::test]
    async fn falls_back_to_name_scan() {
        let record = resolver(false)
            .resolve(&extraction("acme-billing.net", Some("acme industrial")))
            .await;
        assert_eq!(record.supplier_id, "V12345");
    }

    #[tokio::test]
    async fn unknown_domain_yields_unknown_vendor() {
        let record = resolver(false).resolve(&extraction("unknown.biz", None)).await;
        assert_eq!(record.supplier_id, UNKNOWN_VENDOR_ID);
        assert_eq!(record.supplier_type, SupplierType::Unknown);
        assert_eq!(record.routing_code, RoutingCode::ApManual);
        assert!(record.unknown_vendor);
    }

    #[tokio::test]
    async fn directory_errors_are_a_miss() {
        let record = resolver(true)
            .resolve(&extraction("acme.com", Some("Acme")))
            .await;
        assert!(record.unknown_vendor);
    }

    #[tokio::test]
    async fn empty_domain_and_name_skip_lookups() {
        let record = resolver(false).resolve(&extraction("", Some("  "))).await;
        assert!(record.unknown_vendor);
    }
}
