//! Campaign spec files: the YAML a user applies.
//!
//! ```yaml
//! name: fix-license
//! description: Add the missing license header
//! namespace: { kind: user, name: alice }
//! author: alice
//! changesets:
//!   - repository: github.com/acme/api
//!     external_id: "1234"
//!   - repository: github.com/acme/web
//!     base_ref: main
//!     base_rev: 4f2a1c
//!     head_ref: campaigns/fix-license
//!     title: Add license header
//!     body: Automated change.
//!     published: true
//!     commits:
//!       - message: Add license header
//!         diff: "..."
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{io_err, CoreError};
use crate::types::{BranchChange, ChangesetSpecDescription, Namespace};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignSpecFile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub namespace: Namespace,
    /// Defaults to the namespace owner.
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub changesets: Vec<ChangesetTemplate>,
}

/// One repository's entry in a spec file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetTemplate {
    /// Repository name as registered, e.g. `github.com/acme/api`.
    pub repository: String,
    #[serde(flatten)]
    pub change: TemplateChange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateChange {
    Existing { external_id: String },
    Branch(BranchChange),
}

impl From<TemplateChange> for ChangesetSpecDescription {
    fn from(change: TemplateChange) -> Self {
        match change {
            TemplateChange::Existing { external_id } => {
                ChangesetSpecDescription::Existing { external_id }
            }
            TemplateChange::Branch(branch) => ChangesetSpecDescription::Branch(branch),
        }
    }
}

impl CampaignSpecFile {
    /// Read and validate the spec file at `path`.
    pub fn load_at(path: &Path) -> Result<Self, CoreError> {
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        Self::parse(&contents, path.to_path_buf())
    }

    /// Parse spec YAML; `origin` only annotates errors.
    pub fn parse(contents: &str, origin: PathBuf) -> Result<Self, CoreError> {
        let spec: Self = serde_yaml::from_str(contents).map_err(|e| CoreError::Parse {
            path: origin,
            source: e,
        })?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn author(&self) -> &str {
        match (&self.author, &self.namespace) {
            (Some(author), _) => author,
            (None, Namespace::User(name) | Namespace::Org(name)) => name,
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidInput("campaign name is empty".to_string()));
        }
        for (i, template) in self.changesets.iter().enumerate() {
            if template.repository.trim().is_empty() {
                return Err(CoreError::InvalidInput(format!(
                    "changesets[{i}]: repository is empty"
                )));
            }
            match &template.change {
                TemplateChange::Existing { external_id } if external_id.trim().is_empty() => {
                    return Err(CoreError::InvalidInput(format!(
                        "changesets[{i}]: external_id is empty"
                    )));
                }
                TemplateChange::Branch(branch) if branch.head_ref.trim().is_empty() => {
                    return Err(CoreError::InvalidInput(format!(
                        "changesets[{i}]: head_ref is empty"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    const SPEC: &str = r#"
name: fix-license
namespace: { kind: org, name: acme }
changesets:
  - repository: github.com/acme/api
    external_id: "1234"
  - repository: github.com/acme/web
    base_ref: main
    base_rev: 4f2a1c
    head_ref: campaigns/fix-license
    title: Add license header
    published: true
    commits:
      - message: Add license header
        diff: "+// MIT\n"
"#;

    #[test]
    fn parses_both_template_kinds() {
        let spec = CampaignSpecFile::parse(SPEC, PathBuf::from("spec.yaml")).unwrap();
        assert_eq!(spec.author(), "acme");
        assert_eq!(spec.changesets.len(), 2);
        assert_eq!(
            spec.changesets[0].change,
            TemplateChange::Existing {
                external_id: "1234".to_string()
            }
        );
        match &spec.changesets[1].change {
            TemplateChange::Branch(branch) => {
                assert_eq!(branch.head_ref, "campaigns/fix-license");
                assert_eq!(branch.published, Some(true));
                assert_eq!(branch.diff(), "+// MIT\n");
            }
            other => panic!("expected branch template, got {other:?}"),
        }
    }

    #[test]
    fn load_at_reports_path_on_bad_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.yaml");
        std::fs::write(&path, "name: [unclosed").unwrap();
        let err = CampaignSpecFile::load_at(&path).unwrap_err();
        match err {
            CoreError::Parse { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn empty_head_ref_rejected() {
        let yaml = r#"
name: x
namespace: { kind: user, name: bob }
changesets:
  - repository: github.com/acme/api
    base_ref: main
    base_rev: abc
    head_ref: ""
    title: t
    commits: []
"#;
        let err = CampaignSpecFile::parse(yaml, PathBuf::from("x.yaml")).unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }
}
