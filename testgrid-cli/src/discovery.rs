// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Suite discovery: walks a directory of suites into the task groups the
//! dispatcher schedules against.
//!
//! This is explicitly out of scope for the scheduling core -- the design
//! document calls out "test discovery (walking the filesystem to build a
//! suite)" as an external collaborator. What's here is the thinnest
//! reasonable implementation of that collaborator: one task group per
//! immediate subdirectory of `suite_dir`, one task per `*.test` file found
//! underneath it (recursively), crossed with the requested configuration
//! names.

use camino::{Utf8Path, Utf8PathBuf};
use std::io;
use testgrid_core::message::TaskId;

const TEST_FILE_SUFFIX: &str = ".test";

/// Discovers task groups under `suite_dir`. Group order and task order
/// within each group are both filesystem-sorted, so repeated runs without
/// `--randomize` schedule tasks identically.
pub fn discover_groups(
    suite_dir: &Utf8Path,
    include: Option<&str>,
    exclude: Option<&str>,
    configs: &[String],
) -> io::Result<Vec<(String, Vec<TaskId>)>> {
    let configs: Vec<String> = if configs.is_empty() {
        vec![String::new()]
    } else {
        configs.to_vec()
    };

    let mut suite_names = Vec::new();
    for entry in std::fs::read_dir(suite_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            suite_names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    suite_names.sort();

    let mut groups = Vec::new();
    for suite_name in suite_names {
        let suite_path = suite_dir.join(&suite_name);
        let mut test_names = Vec::new();
        collect_test_names(&suite_path, &suite_path, &mut test_names)?;
        test_names.sort();

        let mut task_ids = Vec::new();
        for test_name in &test_names {
            if let Some(pattern) = include {
                if !test_name.contains(pattern) {
                    continue;
                }
            }
            if let Some(pattern) = exclude {
                if test_name.contains(pattern) {
                    continue;
                }
            }
            for config_name in &configs {
                task_ids.push(TaskId::new(test_name.clone(), config_name.clone()));
            }
        }

        if !task_ids.is_empty() {
            groups.push((suite_name, task_ids));
        }
    }
    Ok(groups)
}

fn collect_test_names(root: &Utf8Path, dir: &Utf8Path, out: &mut Vec<String>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = Utf8PathBuf::from_path_buf(entry.path()).map_err(|raw| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("non-utf8 path in suite directory: {raw:?}"),
            )
        })?;
        if entry.file_type()?.is_dir() {
            collect_test_names(root, &path, out)?;
        } else if path.as_str().ends_with(TEST_FILE_SUFFIX) {
            let relative = path
                .strip_prefix(root)
                .expect("path was built by joining onto root")
                .as_str();
            let test_name = relative.strip_suffix(TEST_FILE_SUFFIX).unwrap_or(relative);
            out.push(test_name.to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Utf8Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    #[test]
    fn discovers_one_group_per_suite_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        touch(&root.join("box").join("basic.test"));
        touch(&root.join("box").join("nested").join("deep.test"));
        touch(&root.join("replication").join("sync.test"));
        touch(&root.join("box").join("ignored.txt"));

        let groups = discover_groups(&root, None, None, &[]).unwrap();
        assert_eq!(groups.len(), 2);

        let (box_name, box_tasks) = &groups[0];
        assert_eq!(box_name, "box");
        let mut names: Vec<_> = box_tasks.iter().map(|t| t.test_name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["basic".to_string(), "nested/deep".to_string()]);
    }

    #[test]
    fn include_and_exclude_filter_by_substring() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        touch(&root.join("box").join("basic.test"));
        touch(&root.join("box").join("slow.test"));

        let groups = discover_groups(&root, Some("basic"), None, &[]).unwrap();
        assert_eq!(groups[0].1.len(), 1);
        assert_eq!(groups[0].1[0].test_name, "basic");

        let groups = discover_groups(&root, None, Some("slow"), &[]).unwrap();
        assert_eq!(groups[0].1.len(), 1);
        assert_eq!(groups[0].1[0].test_name, "basic");
    }

    #[test]
    fn configs_cross_product_with_each_test() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        touch(&root.join("box").join("basic.test"));

        let configs = vec!["memtx".to_string(), "vinyl".to_string()];
        let groups = discover_groups(&root, None, None, &configs).unwrap();
        let mut config_names: Vec<_> = groups[0].1.iter().map(|t| t.config_name.clone()).collect();
        config_names.sort();
        assert_eq!(config_names, vec!["memtx".to_string(), "vinyl".to_string()]);
    }
}
