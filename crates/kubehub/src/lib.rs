//! Reap kubehub: cluster client, discovery and the pruning collaborator.

#![forbid(unsafe_code)]

use std::sync::OnceLock;

use anyhow::{anyhow, bail, Context, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{ApiCapabilities, ApiResource, Discovery, Scope},
    Client,
};
use metrics::counter;
use reap_core::{Action, ChangeSet, Entry, ObjRef, Pruner};
use tracing::{debug, info, warn};

/// Objects carrying this annotation with value `disabled` are never pruned.
pub const PRUNE_ANNOTATION: &str = "reap.io/prune";

static CLIENT: OnceLock<Client> = OnceLock::new();

/// Process-wide client for the current kubeconfig context.
pub async fn get_kube_client() -> Result<Client> {
    if let Some(c) = CLIENT.get() {
        return Ok(c.clone());
    }
    let c = Client::try_default().await.context("creating kube client")?;
    Ok(CLIENT.get_or_init(|| c).clone())
}

pub fn gvk_of(r: &ObjRef) -> GroupVersionKind {
    GroupVersionKind { group: r.group.clone(), version: r.version.clone(), kind: r.kind.clone() }
}

/// Maps group/version/kind to served API resources, from one discovery run.
pub struct Resolver {
    client: Client,
    discovery: Discovery,
}

impl Resolver {
    pub async fn discover(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await.context("running API discovery")?;
        Ok(Self { client, discovery })
    }

    /// Served resource and whether it is namespaced.
    pub fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
        let (ar, caps) = self
            .discovery
            .resolve_gvk(gvk)
            .ok_or_else(|| anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))?;
        Ok((ar, matches!(caps.scope, Scope::Namespaced)))
    }

    pub fn api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }

    /// Served resource for a stored reference, matched on group and kind.
    ///
    /// The stored version is preferred; when the cluster no longer serves it, the group's
    /// recommended version is used. `None` only when the kind itself is gone.
    pub fn resolve_kind(&self, gvk: &GroupVersionKind) -> Option<(ApiResource, bool)> {
        let (ar, caps) = self.discovery.resolve_gvk(gvk).or_else(|| {
            let group = self.discovery.groups().find(|g| g.name() == gvk.group)?;
            recommended_for_kind(group.recommended_resources(), &gvk.kind)
        })?;
        if ar.version != gvk.version {
            debug!(kind = %gvk.kind, stored = %gvk.version, served = %ar.version, "stored version not served; using recommended");
        }
        Some((ar, matches!(caps.scope, Scope::Namespaced)))
    }

    pub fn api_for(&self, r: &ObjRef) -> Option<Api<DynamicObject>> {
        let (ar, namespaced) = self.resolve_kind(&gvk_of(r))?;
        let ns = if namespaced { Some(r.namespace.as_deref().unwrap_or(self.client.default_namespace())) } else { None };
        Some(self.api(&ar, ns))
    }
}

fn recommended_for_kind(resources: Vec<(ApiResource, ApiCapabilities)>, kind: &str) -> Option<(ApiResource, ApiCapabilities)> {
    resources.into_iter().find(|(ar, _)| ar.kind == kind)
}

pub fn prune_disabled(meta: &ObjectMeta) -> bool {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(PRUNE_ANNOTATION))
        .map(|v| v.eq_ignore_ascii_case("disabled"))
        .unwrap_or(false)
}

/// Deletes stale objects with background propagation.
pub struct KubePruner {
    client: Client,
}

impl KubePruner {
    pub fn new(client: Client) -> Self { Self { client } }

    async fn delete_one(&self, resolver: &Resolver, r: &ObjRef) -> Result<Option<Entry>> {
        let Some(api) = resolver.api_for(r) else {
            // Kind no longer served in any version: nothing of it can remain on the cluster.
            debug!(object = %r, "skipping prune of unserved kind");
            return Ok(None);
        };
        let live = match api.get_opt(&r.name).await.with_context(|| format!("reading live {}", r))? {
            Some(o) => o,
            None => {
                debug!(object = %r, "already gone");
                return Ok(None);
            }
        };
        if prune_disabled(&live.metadata) {
            counter!("prune_skipped_total", 1u64);
            info!(object = %r, "prune disabled by annotation; skipping");
            return Ok(None);
        }
        api.delete(&r.name, &DeleteParams::background()).await.with_context(|| format!("deleting {}", r))?;
        counter!("prune_deleted_total", 1u64);
        Ok(Some(Entry::new(r.id(), r.version.clone(), Action::Deleted)))
    }
}

#[async_trait::async_trait]
impl Pruner for KubePruner {
    async fn delete(&self, objects: &[ObjRef]) -> Result<ChangeSet> {
        let mut cs = ChangeSet::new();
        if objects.is_empty() {
            return Ok(cs);
        }
        let resolver = Resolver::discover(self.client.clone()).await?;
        let mut failures = Vec::new();
        // Attempt every object so one failure does not hide the rest.
        for r in objects {
            match self.delete_one(&resolver, r).await {
                Ok(Some(entry)) => {
                    info!(subject = %entry.subject, "deleted");
                    cs.add(entry);
                }
                Ok(None) => {}
                Err(e) => {
                    counter!("prune_err_total", 1u64);
                    warn!(object = %r, error = %e, "prune failed");
                    failures.push(format!("{:#}", e));
                }
            }
        }
        if !failures.is_empty() {
            bail!("failed to delete {} of {} object(s): {}", failures.len(), objects.len(), failures.join("; "));
        }
        Ok(cs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn meta(annotations: &[(&str, &str)]) -> ObjectMeta {
        let map: BTreeMap<String, String> = annotations.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ObjectMeta { name: Some("x".into()), annotations: Some(map), ..Default::default() }
    }

    #[test]
    fn prune_annotation_is_honoured() {
        assert!(prune_disabled(&meta(&[(PRUNE_ANNOTATION, "disabled")])));
        assert!(prune_disabled(&meta(&[(PRUNE_ANNOTATION, "Disabled")])));
        assert!(!prune_disabled(&meta(&[(PRUNE_ANNOTATION, "enabled")])));
        assert!(!prune_disabled(&meta(&[("other", "disabled")])));
        assert!(!prune_disabled(&ObjectMeta::default()));
    }

    fn served(group: &str, version: &str, kind: &str) -> (ApiResource, ApiCapabilities) {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind));
        (ar, ApiCapabilities { scope: Scope::Namespaced, subresources: vec![], operations: vec![] })
    }

    #[test]
    fn dropped_version_falls_back_to_served_one() {
        let group = || vec![served("networking.k8s.io", "v1", "IngressClass"), served("networking.k8s.io", "v1", "Ingress")];
        let (ar, _) = recommended_for_kind(group(), "Ingress").unwrap();
        assert_eq!((ar.group.as_str(), ar.version.as_str(), ar.kind.as_str()), ("networking.k8s.io", "v1", "Ingress"));
        assert!(recommended_for_kind(group(), "NetworkPolicy").is_none());
    }

    #[test]
    fn gvk_of_keeps_group_version_kind() {
        let r = ObjRef {
            group: "apps".into(),
            version: "v1".into(),
            kind: "Deployment".into(),
            namespace: Some("default".into()),
            name: "web".into(),
        };
        let gvk = gvk_of(&r);
        assert_eq!((gvk.group.as_str(), gvk.version.as_str(), gvk.kind.as_str()), ("apps", "v1", "Deployment"));
    }
}
