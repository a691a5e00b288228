use std::collections::{HashMap, HashSet};

use bollard::models::{ContainerSummary, ImageSummary};
use chrono::{TimeZone, Utc};

use super::{Container, ContainerStatus, Image, EXITED_PREFIX, NONE_TAG, REMOVAL_IN_PROGRESS};

/// Outcome of translating a raw container listing.
#[derive(Debug, Default)]
pub struct ContainerListing {
    pub containers: Vec<Container>,
    /// Ids of containers that have exited and must no longer be logged.
    pub exited: Vec<String>,
}

pub fn containers_from_summaries(summaries: Vec<ContainerSummary>) -> ContainerListing {
    let mut listing = ContainerListing::default();
    for summary in summaries {
        let id = summary.id.clone().unwrap_or_default();
        let status = summary.status.clone().unwrap_or_default();
        if status.starts_with(EXITED_PREFIX) {
            listing.exited.push(id.clone());
        }
        if status == REMOVAL_IN_PROGRESS {
            continue;
        }
        listing.containers.push(container_from_summary(id, status, summary));
    }
    listing
}

fn container_from_summary(id: String, status: String, summary: ContainerSummary) -> Container {
    let labels = summary.labels.unwrap_or_default();
    let names = summary.names.unwrap_or_default();
    let name = names
        .first()
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.chars().take(12).collect());

    Container {
        name,
        names,
        image: summary.image.unwrap_or_default(),
        command: summary.command,
        created: summary
            .created
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        status,
        state: ContainerStatus::from(summary.state.unwrap_or_else(|| String::from("running"))),
        swarm_service: labels.get("com.docker.swarm.service.name").cloned(),
        swarm_stack: labels.get("com.docker.stack.namespace").cloned(),
        compose_service: labels.get("com.docker.compose.service").cloned(),
        compose_project: labels.get("com.docker.compose.project").cloned(),
        id,
    }
}

/// Translates a raw image listing into cache entries.
///
/// The first pass collects every parent id referenced by the listing so the
/// second pass can tell intermediate layers (untagged, somebody's parent) from
/// dangling images (untagged, nobody's parent). Each raw image is then fanned
/// out into one entry per `repo:tag`.
pub fn images_from_summaries(raw_images: Vec<ImageSummary>) -> Vec<Image> {
    let parent_ids: HashSet<String> = raw_images
        .iter()
        .filter(|raw| !raw.parent_id.is_empty())
        .map(|raw| raw.parent_id.clone())
        .collect();

    let mut images = Vec::new();
    for raw in raw_images {
        let untagged = is_untagged(&raw.repo_tags);
        let intermediate = untagged && parent_ids.contains(&raw.id);
        let dangling = untagged && !intermediate;
        let created = Utc.timestamp_opt(raw.created, 0).single();

        let mut by_repo = extract_tags_by_repo(&raw.repo_tags);
        if by_repo.is_empty() {
            by_repo.push((NONE_TAG.to_string(), vec![NONE_TAG.to_string()]));
        }
        for (repo, tags) in by_repo {
            for tag in &tags {
                images.push(Image {
                    id: raw.id.clone(),
                    parent_id: raw.parent_id.clone(),
                    repo: repo.clone(),
                    tag: tag.clone(),
                    tags: tags.clone(),
                    repo_tags: raw.repo_tags.clone(),
                    created,
                    size: raw.size,
                    virtual_size: raw.virtual_size,
                    intermediate,
                    dangling,
                });
            }
        }
    }
    images
}

fn is_untagged(repo_tags: &[String]) -> bool {
    let none = format!("{}:{}", NONE_TAG, NONE_TAG);
    repo_tags.iter().all(|t| *t == none)
}

/// Groups `repo:tag` references by repository, keeping first-seen order.
///
/// The tag separator is the last colon that is not part of a registry
/// address, so `localhost:5000/app:1.0` splits into `localhost:5000/app` and
/// `1.0`. A reference without a tag gets `latest`.
pub fn extract_tags_by_repo(repo_tags: &[String]) -> Vec<(String, Vec<String>)> {
    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
    for reference in repo_tags {
        let (repo, tag) = match reference.rfind(':') {
            Some(idx) if !reference[idx + 1..].contains('/') => {
                (&reference[..idx], &reference[idx + 1..])
            }
            _ => (reference.as_str(), "latest"),
        };
        let tags = grouped.entry(repo.to_string()).or_insert_with(|| {
            order.push(repo.to_string());
            Vec::new()
        });
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    }
    order
        .into_iter()
        .map(|repo| {
            let tags = grouped.remove(&repo).unwrap_or_default();
            (repo, tags)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_image(id: &str, parent: &str, tags: &[&str]) -> ImageSummary {
        ImageSummary {
            id: id.to_string(),
            parent_id: parent.to_string(),
            repo_tags: tags.iter().map(|t| t.to_string()).collect(),
            created: 1_600_000_000,
            size: 42,
            ..Default::default()
        }
    }

    fn raw_container(id: &str, name: &str, status: &str) -> ContainerSummary {
        ContainerSummary {
            id: Some(id.to_string()),
            names: Some(vec![format!("/{}", name)]),
            image: Some("busybox".to_string()),
            status: Some(status.to_string()),
            state: Some("running".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn tags_fan_out_by_repo() {
        let images = images_from_summaries(vec![raw_image(
            "sha256:1",
            "",
            &["a:1", "b:x", "a:2"],
        )]);

        assert_eq!(images.len(), 3);
        let a: Vec<&Image> = images.iter().filter(|i| i.repo == "a").collect();
        assert_eq!(a.len(), 2);
        assert!(a.iter().all(|i| i.tags == vec!["1", "2"]));
        assert_eq!(a[0].tag, "1");
        assert_eq!(a[1].tag, "2");
        let b: Vec<&Image> = images.iter().filter(|i| i.repo == "b").collect();
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].tags, vec!["x"]);
        assert!(images.iter().all(|i| !i.dangling && !i.intermediate));
    }

    #[test]
    fn untagged_images_are_dangling_or_intermediate() {
        let images = images_from_summaries(vec![
            raw_image("sha256:layer", "", &["<none>:<none>"]),
            raw_image("sha256:app", "sha256:layer", &["app:latest"]),
            raw_image("sha256:orphan", "", &["<none>:<none>"]),
            raw_image("sha256:empty", "", &[]),
        ]);

        let by_id = |id: &str| images.iter().find(|i| i.id == id).unwrap();
        assert!(by_id("sha256:layer").intermediate);
        assert!(!by_id("sha256:layer").dangling);
        assert!(by_id("sha256:orphan").dangling);
        assert!(!by_id("sha256:orphan").intermediate);
        assert!(by_id("sha256:empty").dangling);
        assert_eq!(by_id("sha256:empty").repo, "<none>");
        let app = by_id("sha256:app");
        assert!(!app.dangling && !app.intermediate);
    }

    #[test]
    fn tagged_parent_is_never_intermediate() {
        let images = images_from_summaries(vec![
            raw_image("sha256:base", "", &["debian:12"]),
            raw_image("sha256:child", "sha256:base", &["child:1"]),
        ]);
        assert!(images.iter().all(|i| !i.intermediate && !i.dangling));
    }

    #[test]
    fn registry_port_is_not_a_tag() {
        let grouped = extract_tags_by_repo(&[
            "localhost:5000/app:1.0".to_string(),
            "localhost:5000/app".to_string(),
        ]);
        assert_eq!(
            grouped,
            vec![(
                "localhost:5000/app".to_string(),
                vec!["1.0".to_string(), "latest".to_string()]
            )]
        );
    }

    #[test]
    fn removal_in_progress_is_excluded_and_exited_reported() {
        let listing = containers_from_summaries(vec![
            raw_container("1", "web", "Up 2 minutes"),
            raw_container("2", "gone", "Removal In Progress"),
            raw_container("3", "job", "Exited (0) 5 seconds ago"),
        ]);

        let ids: Vec<&str> = listing.containers.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(listing.exited, vec!["3".to_string()]);
        assert_eq!(listing.containers[0].name, "web");
        assert!(listing.containers[1].is_exited());
    }

    #[test]
    fn compose_labels_are_extracted() {
        let mut raw = raw_container("1", "proj_web_1", "Up 1 second");
        raw.labels = Some(HashMap::from([
            ("com.docker.compose.project".to_string(), "proj".to_string()),
            ("com.docker.compose.service".to_string(), "web".to_string()),
        ]));
        let listing = containers_from_summaries(vec![raw]);
        let container = &listing.containers[0];
        assert_eq!(container.compose_project.as_deref(), Some("proj"));
        assert_eq!(container.compose_service.as_deref(), Some("web"));
        assert_eq!(container.swarm_stack, None);
    }
}
