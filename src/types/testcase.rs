use std::{
    borrow::Cow,
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::Secret;
use serde::{de::DeserializeOwned, Deserialize};

use crate::types::acp::AccessControlPolicy;

/// Path of a YAML file that contains object definition or object itself
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum FilePathOrObject<T> {
    FilePath(PathBuf),
    Object(T),
}

fn join_or_absolute<'a>(base_path: &'_ Path, path: &'a Path) -> Cow<'a, Path> {
    if path.is_absolute() {
        path.into()
    } else {
        base_path.join(path).into()
    }
}

impl<T> FilePathOrObject<T>
where
    T: DeserializeOwned,
{
    /// Consider multiple YAML Documents and deserialize into list of objects
    pub fn into_objects(self, base_path: &Path) -> Result<Vec<T>> {
        match self {
            Self::Object(o) => Ok(vec![o]),
            Self::FilePath(path) => {
                let path = join_or_absolute(base_path, &path);
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let mut objects = Vec::new();
                for document in serde_yaml::Deserializer::from_str(&content) {
                    // Going through `Value` lets empty documents be skipped.
                    let value = serde_yaml::Value::deserialize(document)
                        .with_context(|| format!("failed to parse {}", path.display()))?;
                    if value.is_null() {
                        continue;
                    }
                    let object = serde_yaml::from_value(value)
                        .with_context(|| format!("failed to deserialize {}", path.display()))?;
                    objects.push(object);
                }
                if objects.is_empty() {
                    let typename = std::any::type_name::<T>();
                    let typename = typename
                        .rsplit_once(':')
                        .map(|(_, typename)| typename)
                        .unwrap_or(typename);
                    return Err(anyhow!(
                        "file {} does not contain {}",
                        path.display(),
                        typename
                    ));
                }
                Ok(objects)
            }
        }
    }
}

/// A file of forward-auth test cases run against a set of policies.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    #[serde(default)]
    pub policies: Vec<FilePathOrObject<AccessControlPolicy>>,
    /// Secrets referenced by the policies
    #[serde(default)]
    pub secrets: Vec<FilePathOrObject<Secret>>,
    pub cases: Vec<Case>,
}

#[derive(Deserialize, Debug)]
pub struct Case {
    #[serde(default)]
    pub name: Option<String>,
    /// Policy reference, `name` (in the `default` namespace) or `name@namespace`
    pub policy: String,
    #[serde(default)]
    pub request: Request,
    pub expected: Expected,
}

/// The request as received by the ingress controller.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_uri() -> String {
    "/".to_string()
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: default_method(),
            uri: default_uri(),
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Expected {
    pub status: u16,
    /// Headers the response must carry. Other headers are not checked.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}
