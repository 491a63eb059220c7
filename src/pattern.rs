//! Pattern discovery (spec §4.2): given a well's files and a step's
//! `variable_components`/`group_by`, groups files that share every
//! non-variable component and differ only on the variable ones, in
//! lexicographic (invariant, then variable) order — this order is the
//! Z-stacking order read back by the `FileManager`.

use crate::config_error;
use crate::error::Result;
use crate::model::{ComponentKind, ComponentTuple, ComponentValue, FileEntry, GroupBy, Pattern};
use std::collections::BTreeMap;

fn value_of(components: &ComponentTuple, kind: ComponentKind) -> Option<ComponentValue> {
    components.iter().find(|(k, _)| *k == kind).map(|(_, v)| v.clone())
}

fn sort_key(file: &FileEntry, ordered_kinds: &[ComponentKind]) -> Vec<ComponentValue> {
    ordered_kinds.iter().filter_map(|k| value_of(&file.components, *k)).collect()
}

/// Discovers patterns for one well's files under one step's configuration.
/// `group_by`'s component, if set, is excluded from the invariant key so it
/// can partition patterns into separate dictionary entries (spec §4.2 "If
/// `group_by != NONE`...").
///
/// Rejects a well whose files produce two entries with the same variable
/// component tuple within one pattern group (spec §9 open question: "two
/// files with the same variable components would be indistinguishable for
/// Z-stacking order").
pub fn discover_patterns(
    files: &[FileEntry],
    variable_components: &[ComponentKind],
    group_by: GroupBy,
) -> Result<Vec<Pattern>> {
    let group_by_kind = match group_by {
        GroupBy::None => None,
        GroupBy::By(k) => Some(k),
    };

    let invariant_kinds: Vec<ComponentKind> = ComponentKind::ALL
        .iter()
        .copied()
        .filter(|k| !variable_components.contains(k) && Some(*k) != group_by_kind)
        .collect();

    // (invariant key, group_by value) -> files
    let mut buckets: BTreeMap<(Vec<ComponentValue>, Option<ComponentValue>), Vec<FileEntry>> = BTreeMap::new();

    for file in files {
        let invariant_key = invariant_kinds.iter().filter_map(|k| value_of(&file.components, *k)).collect::<Vec<_>>();
        let group_value = group_by_kind.and_then(|k| value_of(&file.components, k));
        buckets.entry((invariant_key, group_value)).or_default().push(file.clone());
    }

    let mut patterns: Vec<Pattern> = Vec::new();
    for ((_, group_value), mut group_files) in buckets {
        group_files.sort_by(|a, b| {
            sort_key(a, variable_components)
                .cmp(&sort_key(b, variable_components))
                .then_with(|| a.virtual_path.cmp(&b.virtual_path))
        });
        if group_files.is_empty() {
            continue;
        }
        for pair in group_files.windows(2) {
            if sort_key(&pair[0], variable_components) == sort_key(&pair[1], variable_components) {
                return Err(config_error!(
                    "duplicate variable component tuple between '{}' and '{}'",
                    pair[0].virtual_path,
                    pair[1].virtual_path
                ));
            }
        }
        patterns.push(Pattern { group_key: group_value.map(|v| v.as_key()), files: group_files });
    }

    Ok(patterns)
}
