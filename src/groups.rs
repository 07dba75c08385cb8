//! Named axis groups loaded from YAML.
//!
//! Group files are lists of groups:
//!
//! ```yaml
//! - group:
//!     name: collimator
//!     axes:
//!       - axis: { name: st2_coll_1_x, display: "Coll X" }
//!       - axis: { name: st2_coll_1_y }
//! ```
//!
//! An axis listed in a group takes scale, sense and unit from the catalog
//! (bss.config plus inline definitions) when the catalog knows it, and the
//! defaults otherwise. The display name in the group file always wins.

use crate::axis::AxisDefinition;
use crate::error::AppResult;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// Name of the group holding every catalog axis.
pub const ALL_GROUP: &str = "all";
/// Name of the initially empty favourites group.
pub const FAVORITE_GROUP: &str = "favorite";

/// A named, ordered list of axes.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisGroup {
    /// Group name
    pub name: String,
    /// Member axes in display order
    pub axes: Vec<AxisDefinition>,
}

impl AxisGroup {
    /// Names of the member axes.
    pub fn axis_names(&self) -> Vec<&str> {
        self.axes.iter().map(|axis| axis.name.as_str()).collect()
    }
}

#[derive(Debug, Deserialize)]
struct GroupEntry {
    group: Option<GroupBody>,
}

#[derive(Debug, Deserialize)]
struct GroupBody {
    name: Option<String>,
    #[serde(default)]
    axes: Vec<AxisEntry>,
}

#[derive(Debug, Deserialize)]
struct AxisEntry {
    axis: Option<AxisRef>,
}

#[derive(Debug, Deserialize)]
struct AxisRef {
    name: Option<String>,
    display: Option<String>,
}

/// Parse group YAML against an axis catalog.
///
/// Entries without a `group` key, groups without a name and axes without a
/// name are skipped. An empty document yields no groups.
pub fn parse_groups(yaml: &str, catalog: &[AxisDefinition]) -> AppResult<Vec<AxisGroup>> {
    if yaml.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Option<Vec<GroupEntry>> = serde_yaml::from_str(yaml)?;
    let groups = entries
        .unwrap_or_default()
        .into_iter()
        .filter_map(|entry| entry.group)
        .filter_map(|body| {
            let name = body.name?;
            let axes = body
                .axes
                .into_iter()
                .filter_map(|entry| entry.axis)
                .filter_map(|axis| resolve(axis, catalog))
                .collect();
            Some(AxisGroup { name, axes })
        })
        .collect();
    Ok(groups)
}

fn resolve(axis: AxisRef, catalog: &[AxisDefinition]) -> Option<AxisDefinition> {
    let name = axis.name.filter(|n| !n.is_empty())?;
    let mut definition = catalog
        .iter()
        .find(|known| known.name == name)
        .cloned()
        .unwrap_or_else(|| {
            debug!(target: "axis_tool::config", axis = %name, "axis not in catalog, using defaults");
            AxisDefinition::with_defaults(name.as_str())
        });
    definition.display = axis.display.unwrap_or_else(|| name.clone());
    Some(definition)
}

/// Read a group file.
pub fn load_group_file(path: &Path, catalog: &[AxisDefinition]) -> AppResult<Vec<AxisGroup>> {
    let text = std::fs::read_to_string(path)?;
    let groups = parse_groups(&text, catalog)?;
    debug!(target: "axis_tool::config", path = %path.display(), groups = groups.len(), "loaded group file");
    Ok(groups)
}

/// Read several group files in order, merging later files over earlier ones.
/// Missing files are skipped with a warning.
pub fn load_group_files(paths: &[impl AsRef<Path>], catalog: &[AxisDefinition]) -> AppResult<Vec<AxisGroup>> {
    let mut merged = Vec::new();
    for path in paths {
        let path = path.as_ref();
        if !path.exists() {
            warn!(target: "axis_tool::config", path = %path.display(), "group file not found");
            continue;
        }
        merged = merge_groups(merged, load_group_file(path, catalog)?);
    }
    Ok(merged)
}

/// Merge `user` groups into `base` by group name.
///
/// Axes of a user group are appended to the base group of the same name,
/// skipping names it already has. The result is sorted by group name.
pub fn merge_groups(base: Vec<AxisGroup>, user: Vec<AxisGroup>) -> Vec<AxisGroup> {
    let mut by_name: BTreeMap<String, AxisGroup> = BTreeMap::new();
    for group in base.into_iter().chain(user) {
        match by_name.get_mut(&group.name) {
            Some(existing) => {
                for axis in group.axes {
                    if !existing.axes.iter().any(|known| known.name == axis.name) {
                        existing.axes.push(axis);
                    }
                }
            }
            None => {
                by_name.insert(group.name.clone(), group);
            }
        }
    }
    by_name.into_values().collect()
}

/// Append the `all` group (every catalog axis) and an empty `favorite`
/// group, unless groups of those names already exist.
pub fn with_builtin_groups(mut groups: Vec<AxisGroup>, catalog: &[AxisDefinition]) -> Vec<AxisGroup> {
    if !groups.iter().any(|g| g.name == ALL_GROUP) {
        groups.push(AxisGroup {
            name: ALL_GROUP.to_string(),
            axes: catalog.to_vec(),
        });
    }
    if !groups.iter().any(|g| g.name == FAVORITE_GROUP) {
        groups.push(AxisGroup {
            name: FAVORITE_GROUP.to_string(),
            axes: Vec::new(),
        });
    }
    groups
}

/// Find a group by name.
pub fn find_group<'a>(groups: &'a [AxisGroup], name: &str) -> Option<&'a AxisGroup> {
    groups.iter().find(|group| group.name == name)
}
