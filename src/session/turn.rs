use serde::Serialize;
use uuid::Uuid;

pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Version {
    pub id: String,
    pub content: String,
}

impl Version {
    fn new(content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub key: String,
    pub role: Role,
    versions: Vec<Version>,
    model: Option<String>,
    tools: Vec<ToolInvocation>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            key: new_id(),
            role: Role::User,
            versions: vec![Version::new(text)],
            model: None,
            tools: Vec::new(),
        }
    }

    pub fn assistant_placeholder() -> Self {
        Self {
            key: new_id(),
            role: Role::Assistant,
            versions: vec![Version::new(String::new())],
            model: None,
            tools: Vec::new(),
        }
    }

    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    pub fn canonical(&self) -> &Version {
        &self.versions[0]
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn tools(&self) -> &[ToolInvocation] {
        &self.tools
    }

    pub fn has_version(&self, version_id: &str) -> bool {
        self.versions.iter().any(|v| v.id == version_id)
    }

    pub(crate) fn set_content(&mut self, version_id: &str, content: &str) {
        if let Some(version) = self.versions.iter_mut().find(|v| v.id == version_id) {
            version.content.clear();
            version.content.push_str(content);
        }
    }

    pub(crate) fn set_model(&mut self, model: String) {
        if self.role == Role::Assistant {
            self.model = Some(model);
        }
    }

    pub(crate) fn push_tool(&mut self, name: String, content: String) {
        if self.role == Role::Assistant {
            self.tools.push(ToolInvocation {
                id: new_id(),
                name,
                content,
            });
        }
    }
}
