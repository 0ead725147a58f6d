//! Repository layout for committed objects

use crate::crd::ObjectDescriptor;

/// Path of an object's YAML file:
/// `<rootPath>/<namespace>/<group|core>/<version>/<resource>/<name>.yaml`.
///
/// The namespace component is omitted for cluster-scoped objects, and
/// surrounding slashes in `root_path` are ignored.
pub fn object_path(root_path: &str, object: &ObjectDescriptor) -> String {
    let group = if object.group.is_empty() {
        "core"
    } else {
        object.group.as_str()
    };

    let mut parts: Vec<&str> = Vec::with_capacity(6);
    let root = root_path.trim_matches('/');
    if !root.is_empty() {
        parts.push(root);
    }
    if let Some(ns) = object.namespace.as_deref().filter(|ns| !ns.is_empty()) {
        parts.push(ns);
    }
    parts.push(group);
    parts.push(&object.version);
    parts.push(&object.resource);

    format!("{}/{}.yaml", parts.join("/"), object.name)
}
