use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One output folder and the files that belong in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedGroup {
    /// 1-based position in the plan.
    pub index: usize,
    /// Folder relative to the plan's output root.
    pub folder: PathBuf,
    pub label: Option<String>,
    pub best: Option<PathBuf>,
    pub members: Vec<PathBuf>,
}

/// Everything the organizer will do in one run. Built once, applied once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizePlan {
    pub output_root: PathBuf,
    pub groups: Vec<PlannedGroup>,
}

impl OrganizePlan {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            groups: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn file_count(&self) -> usize {
        self.groups.iter().map(|g| g.members.len()).sum()
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Add a numbered group. Its folder is `<label>_<index>`, or
    /// `group_<index>` without a label, so groups sharing a label stay apart.
    pub fn push_group(
        &mut self,
        label: Option<&str>,
        best: Option<PathBuf>,
        members: Vec<PathBuf>,
    ) -> &PlannedGroup {
        let index = self.groups.len() + 1;
        let label = label.map(sanitize_folder_name).filter(|l| !l.is_empty());
        let folder = match &label {
            Some(label) => format!("{}_{}", label, index),
            None => format!("group_{}", index),
        };
        self.push(index, PathBuf::from(folder), label, best, members)
    }

    /// Add a group whose folder is exactly `name` (sanitized), such as one
    /// folder per tag.
    pub fn push_named(&mut self, name: &str, members: Vec<PathBuf>) -> &PlannedGroup {
        let index = self.groups.len() + 1;
        let mut folder = sanitize_folder_name(name);
        if folder.is_empty() {
            folder = format!("group_{}", index);
        }
        let label = Some(name.to_string());
        self.push(index, PathBuf::from(folder), label, None, members)
    }

    fn push(
        &mut self,
        index: usize,
        folder: PathBuf,
        label: Option<String>,
        best: Option<PathBuf>,
        mut members: Vec<PathBuf>,
    ) -> &PlannedGroup {
        members.sort();
        members.dedup();
        self.groups.push(PlannedGroup {
            index,
            folder,
            label,
            best,
            members,
        });
        &self.groups[index - 1]
    }
}

/// Reduce a label to a safe single path component.
pub fn sanitize_folder_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_alphanumeric() || c == '-' || c == '_' {
            out.push(c);
        } else if (c.is_whitespace() || c == '.') && !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbered_folders_do_not_collide() {
        let mut plan = OrganizePlan::new("/out");
        plan.push_group(Some("cat"), None, vec!["b.jpg".into(), "a.jpg".into()]);
        plan.push_group(Some("cat"), None, vec!["c.jpg".into(), "d.jpg".into()]);
        plan.push_group(None, None, vec!["e.jpg".into(), "f.jpg".into()]);

        let folders: Vec<_> = plan.groups.iter().map(|g| g.folder.clone()).collect();
        assert_eq!(
            folders,
            vec![
                PathBuf::from("cat_1"),
                PathBuf::from("cat_2"),
                PathBuf::from("group_3")
            ]
        );
        assert_eq!(plan.groups[0].members[0], PathBuf::from("a.jpg"));
        assert_eq!(plan.file_count(), 6);
    }

    #[test]
    fn test_sanitize_folder_name() {
        assert_eq!(sanitize_folder_name("a cat on a mat"), "a_cat_on_a_mat");
        assert_eq!(sanitize_folder_name("../../etc"), "etc");
        assert_eq!(sanitize_folder_name("  dog/puppy  "), "dogpuppy");
        assert_eq!(sanitize_folder_name("///"), "");
    }

    #[test]
    fn test_named_group_falls_back_to_index() {
        let mut plan = OrganizePlan::new("/out");
        let group = plan.push_named("???", vec!["a.jpg".into()]);
        assert_eq!(group.folder, PathBuf::from("group_1"));
        assert_eq!(group.label.as_deref(), Some("???"));
    }
}
