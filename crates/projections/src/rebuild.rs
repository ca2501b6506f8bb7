//! Deciding what a worker has to do when it starts.

use crate::{ProjectionInstanceMetadata, ProjectionStatus};

/// What a worker finds when it compares stored instances to its code version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildType {
    /// No instance exists yet; build the first one.
    Initial,
    /// The running instance is current; serve it.
    NoRebuild(ProjectionInstanceMetadata),
    /// The code is newer than the running instance; build a replacement.
    NewRebuild(ProjectionInstanceMetadata),
    /// A replacement build for this code version was interrupted; resume it.
    ContinueRebuild(ProjectionInstanceMetadata),
    /// The first build was interrupted; resume it.
    ContinueInitial(ProjectionInstanceMetadata),
}

/// Which part of the lifecycle a worker is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    /// Serves the running instance, building the first one if needed.
    Master,
    /// Builds the next version alongside the master, then exits.
    Rebuilder,
}

/// The instance currently serving traffic, the newest if several claim to.
pub fn running_instance(
    instances: &[ProjectionInstanceMetadata],
) -> Option<&ProjectionInstanceMetadata> {
    instances
        .iter()
        .filter(|i| i.status == ProjectionStatus::Running)
        .max_by(|a, b| a.version.cmp(&b.version))
}

/// The most recent unfinished build, if any.
pub fn pending_build(
    instances: &[ProjectionInstanceMetadata],
) -> Option<&ProjectionInstanceMetadata> {
    instances
        .iter()
        .filter(|i| i.status == ProjectionStatus::NewBuild)
        .max_by_key(|i| i.created_at)
}

/// Classifies the projection's instances against `code_version`.
///
/// Versions are compared as strings, so version ids must sort in release
/// order (for example zero-padded numbers or dates).
pub fn detect_rebuild_type(
    instances: &[ProjectionInstanceMetadata],
    code_version: &str,
) -> RebuildType {
    let build = pending_build(instances).filter(|b| b.version == code_version);

    match running_instance(instances) {
        None => match build {
            Some(build) => RebuildType::ContinueInitial(build.clone()),
            None => RebuildType::Initial,
        },
        Some(running) if running.version.as_str() >= code_version => {
            RebuildType::NoRebuild(running.clone())
        }
        Some(running) => match build {
            Some(build) => RebuildType::ContinueRebuild(build.clone()),
            None => RebuildType::NewRebuild(running.clone()),
        },
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use common::NodeId;

    use super::*;

    fn instance(name: &str, version: &str, status: ProjectionStatus) -> ProjectionInstanceMetadata {
        let now = Utc::now();
        ProjectionInstanceMetadata {
            name: name.to_string(),
            projection: "tools".to_string(),
            version: version.to_string(),
            minimal_reader_version: version.to_string(),
            current_node: NodeId::from_string("node-a"),
            status,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn detection_table() {
        use ProjectionStatus::*;

        let running = instance("r", "v2", Running);
        let build_v3 = instance("b", "v3", NewBuild);
        let build_v2 = instance("b", "v2", NewBuild);
        let legacy = instance("l", "v1", Legacy);
        let cancelled = instance("c", "v3", CancelledBuild);

        let cases: Vec<(Vec<ProjectionInstanceMetadata>, &str, RebuildType)> = vec![
            (vec![], "v1", RebuildType::Initial),
            (vec![cancelled.clone()], "v3", RebuildType::Initial),
            (
                vec![build_v3.clone()],
                "v3",
                RebuildType::ContinueInitial(build_v3.clone()),
            ),
            // A build for another code version is not resumed
            (vec![build_v2.clone()], "v3", RebuildType::Initial),
            (
                vec![legacy.clone(), running.clone()],
                "v2",
                RebuildType::NoRebuild(running.clone()),
            ),
            // Older code keeps serving the newer running instance
            (
                vec![running.clone()],
                "v1",
                RebuildType::NoRebuild(running.clone()),
            ),
            (
                vec![running.clone(), cancelled.clone()],
                "v3",
                RebuildType::NewRebuild(running.clone()),
            ),
            (
                vec![running.clone(), build_v3.clone()],
                "v3",
                RebuildType::ContinueRebuild(build_v3.clone()),
            ),
        ];

        for (instances, code_version, expected) in cases {
            assert_eq!(
                detect_rebuild_type(&instances, code_version),
                expected,
                "instances {:?} at {code_version}",
                instances.iter().map(|i| (&i.name, &i.version, i.status)).collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn versions_compare_as_strings() {
        let running = instance("r", "9", ProjectionStatus::Running);
        // "10" sorts before "9"
        assert_eq!(
            detect_rebuild_type(&[running.clone()], "10"),
            RebuildType::NoRebuild(running)
        );
    }

    #[test]
    fn latest_pending_build_wins() {
        let mut older = instance("old", "v2", ProjectionStatus::NewBuild);
        older.created_at = Utc::now() - Duration::minutes(5);
        let newer = instance("new", "v2", ProjectionStatus::NewBuild);

        assert_eq!(
            pending_build(&[newer.clone(), older]).map(|i| i.name.as_str()),
            Some("new")
        );
    }
}
