use crate::config::ProjectConfig;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

/// Decides whether a project accepts events signed with a public key.
#[async_trait]
pub trait ProjectValidator: Send + Sync {
    async fn is_valid(&self, project_id: u64, public_key: Option<&str>) -> bool;
}

/// Projects known from configuration.
#[derive(Debug, Default)]
pub struct StaticProjects {
    keys: HashMap<u64, HashSet<String>>,
}

impl StaticProjects {
    pub fn new(projects: &[ProjectConfig]) -> Self {
        let keys = projects
            .iter()
            .map(|project| {
                (
                    project.id,
                    project.public_keys.iter().cloned().collect::<HashSet<_>>(),
                )
            })
            .collect();

        StaticProjects { keys }
    }
}

#[async_trait]
impl ProjectValidator for StaticProjects {
    async fn is_valid(&self, project_id: u64, public_key: Option<&str>) -> bool {
        match (self.keys.get(&project_id), public_key) {
            (Some(keys), Some(key)) => keys.contains(key),
            _ => false,
        }
    }
}
