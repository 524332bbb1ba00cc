//! Opset bookkeeping: which operator definition a node refers to.

use std::collections::BTreeMap;

use convfold_ir::{ONNX_DOMAIN, OpKind, OpType, is_onnx_domain};

use crate::OnnxError;

/// Opset versions a model imports, keyed by domain.
///
/// The default ONNX domain is stored under `""` whichever way the model
/// spells it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpsetVersions {
    versions: BTreeMap<String, i64>,
}

impl OpsetVersions {
    pub fn from_imports<'a>(imports: impl IntoIterator<Item = (&'a str, i64)>) -> Self {
        let versions = imports
            .into_iter()
            .map(|(domain, version)| (normalize(domain).to_string(), version))
            .collect();
        Self { versions }
    }

    /// Imported version of `domain`, if any.
    pub fn version(&self, domain: &str) -> Option<i64> {
        self.versions.get(normalize(domain)).copied()
    }

    /// Identifies the operator definition behind `op_type` in `domain`.
    pub fn resolve(&self, op_type: &str, domain: &str) -> Result<OpType, OnnxError> {
        if is_onnx_domain(domain) {
            let opset = self
                .version(ONNX_DOMAIN)
                .ok_or(OnnxError::MissingDefaultOpset)?;
            let kind = OpKind::from_onnx(op_type);
            return Ok(OpType {
                since_version: since_version(&kind, opset),
                kind,
                domain: domain.to_string(),
            });
        }

        let opset = self.version(domain).unwrap_or_else(|| {
            log::warn!("domain '{domain}' of operator '{op_type}' is not imported; assuming 1");
            1
        });
        Ok(OpType {
            kind: OpKind::Custom(op_type.to_string()),
            since_version: clamp_version(opset),
            domain: domain.to_string(),
        })
    }
}

fn normalize(domain: &str) -> &str {
    if is_onnx_domain(domain) {
        ONNX_DOMAIN
    } else {
        domain
    }
}

/// The version in which the definition of `kind` that is current at
/// default-domain opset `opset` was introduced.
///
/// Operators without a tracked history resolve to `opset` itself.
pub fn since_version(kind: &OpKind, opset: i64) -> u32 {
    match kind {
        OpKind::Conv => match opset {
            ..=10 => 1,
            11..=21 => 11,
            _ => 22,
        },
        OpKind::Mul => match opset {
            ..=5 => 1,
            6 => 6,
            7..=12 => 7,
            13 => 13,
            _ => 14,
        },
        _ => clamp_version(opset),
    }
}

fn clamp_version(opset: i64) -> u32 {
    u32::try_from(opset.max(1)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_versions() {
        assert_eq!(since_version(&OpKind::Conv, 1), 1);
        assert_eq!(since_version(&OpKind::Conv, 10), 1);
        assert_eq!(since_version(&OpKind::Conv, 11), 11);
        assert_eq!(since_version(&OpKind::Conv, 17), 11);
        assert_eq!(since_version(&OpKind::Conv, 22), 22);
    }

    #[test]
    fn mul_versions() {
        let resolved: Vec<_> = [1, 5, 6, 7, 12, 13, 14, 21]
            .into_iter()
            .map(|opset| since_version(&OpKind::Mul, opset))
            .collect();
        assert_eq!(resolved, vec![1, 1, 6, 7, 7, 13, 14, 14]);
    }

    #[test]
    fn other_ops_use_the_opset() {
        assert_eq!(since_version(&OpKind::Relu, 14), 14);
        assert_eq!(since_version(&OpKind::Relu, -3), 1);
    }

    #[test]
    fn resolve_default_domain_aliases() {
        let opsets = OpsetVersions::from_imports([("ai.onnx", 13)]);
        assert_eq!(opsets.version(""), Some(13));

        let op = opsets.resolve("Mul", "").unwrap();
        assert_eq!(op, OpType::onnx(OpKind::Mul, 13));
        let op = opsets.resolve("Conv", "ai.onnx").unwrap();
        assert_eq!((op.kind, op.since_version), (OpKind::Conv, 11));
    }

    #[test]
    fn resolve_custom_domain() {
        let opsets = OpsetVersions::from_imports([("", 13), ("com.example", 2)]);
        let op = opsets.resolve("Conv", "com.example").unwrap();
        assert_eq!(op.kind, OpKind::Custom("Conv".into()));
        assert_eq!(op.since_version, 2);
        assert_eq!(opsets.resolve("Thing", "org.unknown").unwrap().since_version, 1);
    }

    #[test]
    fn default_domain_must_be_imported() {
        let opsets = OpsetVersions::from_imports([("com.example", 1)]);
        assert!(matches!(
            opsets.resolve("Relu", ""),
            Err(OnnxError::MissingDefaultOpset)
        ));
    }
}
