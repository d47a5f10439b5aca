use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use kube::{
    api::{Patch, PatchParams},
    core::GroupVersionKind,
    Client,
};
use metrics::{counter, histogram};
use reap_core::{Action, ApplyEngine, ChangeSet, Entry};
use reap_kubehub::Resolver;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::{object_id, split_stages};

/// Discovery rounds spent waiting for freshly applied CRDs to be served.
const CRD_DISCOVERY_ATTEMPTS: u32 = 10;
const CRD_DISCOVERY_INTERVAL: Duration = Duration::from_millis(500);

fn gvk_of_object(obj: &Json) -> Result<GroupVersionKind> {
    let (id, version) = object_id(obj)?;
    Ok(GroupVersionKind { group: id.group, version, kind: id.kind })
}

/// Kinds among `objects` that `served` does not know, deduplicated, in input order.
fn unserved_kinds(objects: &[Json], served: impl Fn(&GroupVersionKind) -> bool) -> Vec<GroupVersionKind> {
    let mut out: Vec<GroupVersionKind> = Vec::new();
    for gvk in objects.iter().filter_map(|o| gvk_of_object(o).ok()) {
        if !served(&gvk) && !out.contains(&gvk) {
            out.push(gvk);
        }
    }
    out
}

/// Server-side apply against the cluster behind `client`.
pub struct KubeApply {
    client: Client,
    field_manager: String,
    force: bool,
    dry_run: bool,
}

impl KubeApply {
    pub fn new(client: Client) -> Self {
        let field_manager = std::env::var("REAP_FIELD_MANAGER").unwrap_or_else(|_| "reap".to_string());
        Self { client, field_manager, force: true, dry_run: false }
    }

    /// Ask the API server to validate without persisting.
    pub fn dry_run(mut self, on: bool) -> Self {
        self.dry_run = on;
        self
    }

    /// Take ownership of fields managed by other field managers.
    pub fn force(mut self, on: bool) -> Self {
        self.force = on;
        self
    }

    fn patch_params(&self) -> PatchParams {
        let mut pp = PatchParams::apply(&self.field_manager);
        if self.force { pp = pp.force(); }
        if self.dry_run { pp = pp.dry_run(); }
        pp
    }

    async fn apply_one(&self, resolver: &Resolver, mut obj: Json) -> Result<Entry> {
        let t0 = std::time::Instant::now();
        counter!("apply_attempts", 1u64);
        let (mut id, version) = object_id(&obj)?;
        let (ar, namespaced) = resolver.resolve(&gvk_of_object(&obj)?)?;

        // Namespaced objects without a namespace land in the client's default namespace;
        // cluster-scoped objects never carry one.
        if namespaced && id.namespace.is_empty() {
            id.namespace = self.client.default_namespace().to_string();
        } else if !namespaced {
            id.namespace.clear();
        }
        set_namespace(&mut obj, (!id.namespace.is_empty()).then_some(id.namespace.as_str()))?;

        let api = resolver.api(&ar, (!id.namespace.is_empty()).then_some(id.namespace.as_str()));
        let before = api.get_opt(&id.name).await.with_context(|| format!("reading live {}", id))?;
        let applied = match api.patch(&id.name, &self.patch_params(), &Patch::Apply(&obj)).await {
            Ok(o) => o,
            Err(e) => {
                counter!("apply_err", 1u64);
                return Err(anyhow!("server-side apply of {} failed: {}", id, e));
            }
        };
        let action = match before {
            None => Action::Created,
            Some(prev) if prev.metadata.resource_version != applied.metadata.resource_version => Action::Configured,
            Some(_) => Action::Unchanged,
        };
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("apply_ok", 1u64);
        let entry = Entry::new(id, version, action);
        debug!(subject = %entry.subject, action = %entry.action, dry_run = self.dry_run, "applied");
        Ok(entry)
    }
}

impl KubeApply {
    /// Run discovery again until every kind in `pending` is served or the attempts run out.
    ///
    /// Dry runs never persist CRDs, so they get a single round.
    async fn rediscover(&self, mut resolver: Resolver, pending: &[Json]) -> Result<Resolver> {
        if unserved_kinds(pending, |g| resolver.resolve(g).is_ok()).is_empty() {
            return Ok(resolver);
        }
        let attempts = if self.dry_run { 1 } else { CRD_DISCOVERY_ATTEMPTS };
        for attempt in 1..=attempts {
            resolver = Resolver::discover(self.client.clone()).await?;
            let missing = unserved_kinds(pending, |g| resolver.resolve(g).is_ok());
            if missing.is_empty() {
                debug!(attempt, "new kinds served");
                return Ok(resolver);
            }
            if attempt == attempts {
                warn!(missing = missing.len(), kind = %missing[0].kind, "kinds still not served after applying CRDs");
            } else {
                tokio::time::sleep(CRD_DISCOVERY_INTERVAL).await;
            }
        }
        Ok(resolver)
    }
}

fn set_namespace(obj: &mut Json, namespace: Option<&str>) -> Result<()> {
    let meta = obj
        .get_mut("metadata")
        .and_then(|m| m.as_object_mut())
        .ok_or_else(|| anyhow!("object missing metadata"))?;
    match namespace {
        Some(ns) => { meta.insert("namespace".into(), Json::String(ns.to_string())); }
        None => { meta.remove("namespace"); }
    }
    Ok(())
}

#[async_trait::async_trait]
impl ApplyEngine for KubeApply {
    async fn apply(&self, objects: Vec<Json>) -> Result<ChangeSet> {
        let (definitions, rest) = split_stages(objects);
        let mut resolver = Resolver::discover(self.client.clone()).await?;
        let mut cs = ChangeSet::new();
        for obj in definitions {
            cs.add(self.apply_one(&resolver, obj).await?);
        }
        if cs.iter().any(|e| e.id.kind == "CustomResourceDefinition") && !rest.is_empty() {
            resolver = self.rediscover(resolver, &rest).await?;
        }
        for obj in rest {
            cs.add(self.apply_one(&resolver, obj).await?);
        }
        info!(
            created = cs.count(Action::Created),
            configured = cs.count(Action::Configured),
            unchanged = cs.count(Action::Unchanged),
            dry_run = self.dry_run,
            "apply finished"
        );
        Ok(cs)
    }
}
