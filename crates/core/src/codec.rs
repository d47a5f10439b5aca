//! Compact string encoding of [`ObjectId`] used by the persisted inventory.

use crate::{InventoryError, InventoryResult, ObjectId};

const FIELD_SEP: char = '_';
// RBAC object names may contain ':' (e.g. system:controller); it is not allowed in the compact form.
const COLON_ESCAPED: &str = "__";

/// Encodes and decodes the persisted identity form.
pub trait IdentityCodec: Send + Sync {
    fn encode(&self, id: &ObjectId) -> String;
    fn decode(&self, raw: &str) -> InventoryResult<ObjectId>;
}

/// `namespace_name_group_kind`, e.g. `default_podinfo_apps_Deployment` or `_flux-system__Namespace`.
///
/// Assumes names never contain `_`, which Kubernetes object names disallow. Under that
/// assumption the `:` escape is reversible; without it `a:b` and `a__b` share one encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactCodec;

impl IdentityCodec for CompactCodec {
    fn encode(&self, id: &ObjectId) -> String {
        let name = id.name.replace(':', COLON_ESCAPED);
        format!("{}{sep}{}{sep}{}{sep}{}", id.namespace, name, id.group, id.kind, sep = FIELD_SEP)
    }

    fn decode(&self, raw: &str) -> InventoryResult<ObjectId> {
        let fail = |reason: &str| InventoryError::Parse { id: raw.to_string(), reason: reason.to_string() };

        let (namespace, rest) = raw.split_once(FIELD_SEP).ok_or_else(|| fail("missing namespace separator"))?;
        let (rest, kind) = rest.rsplit_once(FIELD_SEP).ok_or_else(|| fail("missing kind separator"))?;
        let (name, group) = rest.rsplit_once(FIELD_SEP).ok_or_else(|| fail("missing group separator"))?;
        if name.is_empty() {
            return Err(fail("empty name"));
        }
        if kind.is_empty() {
            return Err(fail("empty kind"));
        }
        Ok(ObjectId {
            namespace: namespace.to_string(),
            name: name.replace(COLON_ESCAPED, ":"),
            group: group.to_string(),
            kind: kind.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_namespaced_and_cluster_scoped() {
        let c = CompactCodec;
        assert_eq!(c.encode(&ObjectId::new("default", "podinfo", "apps", "Deployment")), "default_podinfo_apps_Deployment");
        assert_eq!(c.encode(&ObjectId::new("", "flux-system", "", "Namespace")), "_flux-system__Namespace");
    }

    #[test]
    fn decode_reverses_encode_for_colon_names() {
        let c = CompactCodec;
        let id = ObjectId::new("", "system:controller:reap", "rbac.authorization.k8s.io", "ClusterRole");
        let raw = c.encode(&id);
        assert_eq!(raw, "_system__controller__reap_rbac.authorization.k8s.io_ClusterRole");
        assert_eq!(c.decode(&raw).unwrap(), id);
    }

    #[test]
    fn underscore_names_collide_with_escaped_colons() {
        let c = CompactCodec;
        let colon = ObjectId::new("", "a:b", "rbac.authorization.k8s.io", "ClusterRole");
        let underscore = ObjectId::new("", "a__b", "rbac.authorization.k8s.io", "ClusterRole");
        assert_eq!(c.encode(&colon), c.encode(&underscore));
        assert_eq!(c.decode(&c.encode(&underscore)).unwrap(), colon);
    }

    #[test]
    fn decode_rejects_malformed_ids() {
        let c = CompactCodec;
        for raw in ["", "no-separators", "ns_name", "ns__apps_Deployment", "ns_name_apps_"] {
            let err = c.decode(raw).unwrap_err();
            assert!(matches!(err, InventoryError::Parse { .. }), "raw={:?} err={:?}", raw, err);
        }
    }
}
