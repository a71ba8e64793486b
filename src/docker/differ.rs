//! Desired-vs-actual diffing.
//!
//! The decision core is a pure function over the compose project and the
//! labeled containers the runtime reports, so the whole decision table is
//! testable without a daemon. `Client::diff` supplies the live inputs.

use std::collections::HashMap;

use strum::Display;

use crate::compose::{config_hash, Project};

use super::{service_actual, with_timeout, Client, DockerError, ServiceActual, DEFAULT_TIMEOUT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum DiffAction {
    Create,
    Update,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDiff {
    pub service: String,
    pub action: DiffAction,
    pub desired_image: String,
    pub current_image: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffResult {
    pub changes: Vec<ServiceDiff>,
    pub in_sync: bool,
    pub summary: String,
}

impl Client {
    /// Diff the project against the runtime. Desired images are resolved to
    /// local image ids by name; an image that is not present locally counts
    /// as changed.
    pub async fn diff(&self, project: &Project) -> Result<DiffResult, DockerError> {
        let containers = self.list_managed_containers().await?;
        let actuals = containers.iter().map(service_actual).collect();

        let mut image_ids = HashMap::new();
        for spec in project.services.values() {
            if !image_ids.contains_key(&spec.image) {
                let id = self.resolve_image_id(&spec.image).await?;
                image_ids.insert(spec.image.clone(), id);
            }
        }

        Ok(diff_services(project, actuals, &image_ids))
    }

    /// The local image id for an image reference, or `None` when the image
    /// has not been pulled yet.
    pub(crate) async fn resolve_image_id(
        &self,
        image: &str,
    ) -> Result<Option<String>, DockerError> {
        let inspect = with_timeout(
            "inspect image",
            DEFAULT_TIMEOUT,
            self.docker().inspect_image(image),
        )
        .await?;

        match inspect {
            Ok(details) => Ok(details.id),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(err) => Err(DockerError::Api(err)),
        }
    }
}

/// Compute per-service actions. Order-insensitive over its inputs; the
/// summary lists actions in create, update, remove order.
pub fn diff_services(
    project: &Project,
    actuals: Vec<ServiceActual>,
    image_ids: &HashMap<String, Option<String>>,
) -> DiffResult {
    let mut actual_by_service: HashMap<String, ServiceActual> = actuals
        .into_iter()
        .map(|actual| (actual.service.clone(), actual))
        .collect();

    let mut changes = Vec::new();

    for (name, spec) in &project.services {
        let Some(actual) = actual_by_service.remove(name) else {
            changes.push(ServiceDiff {
                service: name.clone(),
                action: DiffAction::Create,
                desired_image: spec.image.clone(),
                current_image: String::new(),
                reason: "service not deployed".to_string(),
            });
            continue;
        };

        if actual.state != "running" {
            changes.push(ServiceDiff {
                service: name.clone(),
                action: DiffAction::Update,
                desired_image: spec.image.clone(),
                current_image: actual.image,
                reason: format!("container not running (state: {})", actual.state),
            });
            continue;
        }

        let image_changed = match image_ids.get(&spec.image) {
            Some(Some(id)) => *id != actual.image_id,
            // Image not found locally; a pull is required either way.
            _ => true,
        };
        if image_changed {
            changes.push(ServiceDiff {
                service: name.clone(),
                action: DiffAction::Update,
                desired_image: spec.image.clone(),
                current_image: actual.image,
                reason: "image updated".to_string(),
            });
            continue;
        }

        if actual.config_hash != config_hash(spec) {
            changes.push(ServiceDiff {
                service: name.clone(),
                action: DiffAction::Update,
                desired_image: spec.image.clone(),
                current_image: actual.image,
                reason: "config changed".to_string(),
            });
        }
    }

    let mut orphans: Vec<_> = actual_by_service.into_values().collect();
    orphans.sort_by(|a, b| a.service.cmp(&b.service));
    for orphan in orphans {
        changes.push(ServiceDiff {
            service: orphan.service,
            action: DiffAction::Remove,
            desired_image: String::new(),
            current_image: orphan.image,
            reason: "service removed from compose file".to_string(),
        });
    }

    let summary = build_summary(&changes);
    DiffResult {
        in_sync: changes.is_empty(),
        changes,
        summary,
    }
}

fn build_summary(changes: &[ServiceDiff]) -> String {
    if changes.is_empty() {
        return "all services in sync".to_string();
    }

    [DiffAction::Create, DiffAction::Update, DiffAction::Remove]
        .into_iter()
        .filter_map(|action| {
            let count = changes.iter().filter(|c| c.action == action).count();
            (count > 0).then(|| format!("{count} to {action}"))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose;

    fn project(content: &str) -> Project {
        compose::load(content, "demo").unwrap()
    }

    fn running(service: &str, image: &str, image_id: &str, hash: &str) -> ServiceActual {
        ServiceActual {
            service: service.to_string(),
            container_id: format!("{service}-container"),
            image: image.to_string(),
            image_id: image_id.to_string(),
            state: "running".to_string(),
            config_hash: hash.to_string(),
        }
    }

    fn resolved(image: &str, id: &str) -> HashMap<String, Option<String>> {
        HashMap::from([(image.to_string(), Some(id.to_string()))])
    }

    const WEB: &str = "services:\n  web:\n    image: nginx:alpine\n";

    #[test]
    fn missing_service_creates() {
        let result = diff_services(&project(WEB), vec![], &resolved("nginx:alpine", "sha:1"));

        assert!(!result.in_sync);
        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.changes[0].action, DiffAction::Create);
        assert_eq!(result.changes[0].reason, "service not deployed");
        assert_eq!(result.summary, "1 to create");
    }

    #[test]
    fn stopped_container_updates() {
        let p = project(WEB);
        let hash = config_hash(&p.services["web"]);
        let mut actual = running("web", "nginx:alpine", "sha:1", &hash);
        actual.state = "exited".to_string();

        let result = diff_services(&p, vec![actual], &resolved("nginx:alpine", "sha:1"));

        assert_eq!(result.changes[0].action, DiffAction::Update);
        assert_eq!(result.changes[0].reason, "container not running (state: exited)");
    }

    #[test]
    fn image_id_mismatch_updates() {
        let p = project(WEB);
        let hash = config_hash(&p.services["web"]);
        let actual = running("web", "nginx:alpine", "sha:old", &hash);

        let result = diff_services(&p, vec![actual], &resolved("nginx:alpine", "sha:new"));

        assert_eq!(result.changes[0].action, DiffAction::Update);
        assert_eq!(result.changes[0].reason, "image updated");
    }

    #[test]
    fn unresolved_image_counts_as_changed() {
        let p = project(WEB);
        let hash = config_hash(&p.services["web"]);
        let actual = running("web", "nginx:alpine", "sha:1", &hash);

        let image_ids = HashMap::from([("nginx:alpine".to_string(), None)]);
        let result = diff_services(&p, vec![actual], &image_ids);

        assert_eq!(result.changes[0].reason, "image updated");
    }

    #[test]
    fn config_hash_mismatch_updates() {
        let p = project(WEB);
        let actual = running("web", "nginx:alpine", "sha:1", "outdated-hash");

        let result = diff_services(&p, vec![actual], &resolved("nginx:alpine", "sha:1"));

        assert_eq!(result.changes[0].action, DiffAction::Update);
        assert_eq!(result.changes[0].reason, "config changed");
    }

    #[test]
    fn orphan_removes() {
        let p = project(WEB);
        let hash = config_hash(&p.services["web"]);
        let web = running("web", "nginx:alpine", "sha:1", &hash);
        let orphan = running("old", "redis:7", "sha:2", "whatever");

        let result = diff_services(&p, vec![web, orphan], &resolved("nginx:alpine", "sha:1"));

        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.changes[0].service, "old");
        assert_eq!(result.changes[0].action, DiffAction::Remove);
        assert_eq!(result.changes[0].reason, "service removed from compose file");
        assert_eq!(result.changes[0].current_image, "redis:7");
    }

    #[test]
    fn in_sync() {
        let p = project(WEB);
        let hash = config_hash(&p.services["web"]);
        let actual = running("web", "nginx:alpine", "sha:1", &hash);

        let result = diff_services(&p, vec![actual], &resolved("nginx:alpine", "sha:1"));

        assert!(result.in_sync);
        assert!(result.changes.is_empty());
        assert_eq!(result.summary, "all services in sync");
    }

    #[test]
    fn summary_counts_in_fixed_order() {
        let raw = "services:\n  a:\n    image: a:1\n  b:\n    image: b:1\n  c:\n    image: c:1\n";
        let p = project(raw);
        let hash = config_hash(&p.services["c"]);

        let mut stopped = running("c", "c:1", "sha:c", &hash);
        stopped.state = "exited".to_string();
        let orphan = running("zz", "zz:1", "sha:zz", "hash");

        let image_ids = HashMap::from([
            ("a:1".to_string(), Some("sha:a".to_string())),
            ("b:1".to_string(), Some("sha:b".to_string())),
            ("c:1".to_string(), Some("sha:c".to_string())),
        ]);

        let result = diff_services(&p, vec![stopped, orphan], &image_ids);
        assert_eq!(result.summary, "2 to create, 1 to update, 1 to remove");
    }

    #[test]
    fn input_order_does_not_matter() {
        let raw = "services:\n  a:\n    image: a:1\n  b:\n    image: b:1\n";
        let p = project(raw);
        let hash_a = config_hash(&p.services["a"]);
        let hash_b = config_hash(&p.services["b"]);

        let one = running("a", "a:1", "sha:a", &hash_a);
        let two = running("b", "b:1", "sha:b", &hash_b);
        let image_ids = HashMap::from([
            ("a:1".to_string(), Some("sha:a".to_string())),
            ("b:1".to_string(), Some("sha:b".to_string())),
        ]);

        let forward = diff_services(&p, vec![one.clone(), two.clone()], &image_ids);
        let reverse = diff_services(&p, vec![two, one], &image_ids);
        assert_eq!(forward, reverse);
        assert!(forward.in_sync);
    }
}
