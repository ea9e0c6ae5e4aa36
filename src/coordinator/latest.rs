//! Latest-version resolution over a project's artifacts
//!
//! A linear scan, recomputed on every project read. Version strings that do
//! not parse are skipped.

use crate::common::Version;
use crate::coordinator::metadata::VersionStamp;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A version together with its upload time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleasedVersion {
    pub version: Version,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LatestVersions {
    /// Highest version overall, prereleases included
    pub latest: Option<ReleasedVersion>,
    /// Highest version without a prerelease token
    pub latest_stable: Option<ReleasedVersion>,
}

/// Compute both maxima in one pass
pub fn resolve_latest<'a, I>(stamps: I) -> LatestVersions
where
    I: IntoIterator<Item = &'a VersionStamp>,
{
    let mut result = LatestVersions::default();

    for stamp in stamps {
        let Some(version) = Version::try_parse(&stamp.version) else {
            tracing::debug!(version = %stamp.version, "Skipping unparseable version");
            continue;
        };

        if version.is_stable() && is_higher(&result.latest_stable, &version) {
            result.latest_stable = Some(ReleasedVersion {
                version: version.clone(),
                timestamp: stamp.timestamp,
            });
        }
        if is_higher(&result.latest, &version) {
            result.latest = Some(ReleasedVersion {
                version,
                timestamp: stamp.timestamp,
            });
        }
    }

    result
}

fn is_higher(current: &Option<ReleasedVersion>, candidate: &Version) -> bool {
    current
        .as_ref()
        .map_or(true, |best| *candidate > best.version)
}
