//! The resource set provisioned by `boot`
//!
//! ```text
//! ssh-key-0 .. ssh-key-N ─┐
//!                         ├──▶ server ──┐
//! backup-volume ──────────┘             ├──▶ backup-volume-attachment
//!        └──────────────────────────────┘
//! ```
//!
//! The server's user data is the cloud-init template rendered with the env
//! file variables plus `BACKUP_VOLUME_PATH`, which only becomes known once the
//! volume exists.

use bootflow_cloud::{Deferred, LifecyclePolicy, ResourceKind, ResourceSet, ResourceSpec};
use bootflow_config::StackConfig;
use bootflow_core::{Template, Variables, merge_variables};
use serde_json::Value;

/// Variable carrying the volume's device path into the template
pub const VOLUME_PATH_VAR: &str = "BACKUP_VOLUME_PATH";

pub const VOLUME: &str = "backup-volume";
pub const SERVER: &str = "server";
pub const ATTACHMENT: &str = "backup-volume-attachment";

pub fn ssh_key(index: usize) -> String {
    format!("ssh-key-{}", index)
}

/// Render the cloud-init payload
///
/// The volume path always wins over an env file variable of the same name.
pub fn render_user_data(template: &Template, vars: &Variables, volume_path: Option<&str>) -> String {
    let mut computed = Variables::new();
    if let Some(path) = volume_path {
        computed.insert(VOLUME_PATH_VAR.to_string(), path.to_string());
    }
    let merged = merge_variables([vars.clone(), computed]);

    let rendered = template.render(&merged);
    for name in &rendered.missing {
        tracing::warn!(variable = %name, "Template variable has no value, rendering as empty");
    }
    rendered.text
}

/// Declare every resource of the stack
pub fn build(config: &StackConfig, template: &Template, vars: &Variables) -> ResourceSet {
    let mut set = ResourceSet::new();

    let mut key_ids = Vec::new();
    for (index, public_key) in config.ssh_keys.iter().enumerate() {
        let name = ssh_key(index);
        set.add(
            ResourceSpec::new(&name, ResourceKind::SshKey)
                .with_attr("name", config.ssh_key_name(index))
                .with_attr("publicKey", public_key.as_str())
                .with_policy(LifecyclePolicy::new().with_replace_triggers(["publicKey"])),
        );
        key_ids.push(Deferred::id(name));
    }

    set.add(
        ResourceSpec::new(VOLUME, ResourceKind::Volume)
            .with_attr("name", config.volume_name())
            .with_attr("size", config.volume_size)
            .with_attr("location", config.location.as_str())
            .with_attr("format", "ext4")
            .with_policy(
                LifecyclePolicy::new()
                    .with_protect()
                    .with_replace_triggers(["location", "format"]),
            ),
    );

    let template = template.clone();
    let vars = vars.clone();
    let user_data = Deferred::output(VOLUME, "linux_device").try_map(move |device| {
        let device = device.as_str().ok_or_else(|| bootflow_cloud::CloudError::InvalidAttribute {
            attribute: "linux_device".to_string(),
            message: format!("expected a string, got {}", device),
        })?;
        Ok(Value::String(render_user_data(&template, &vars, Some(device))))
    });

    set.add(
        ResourceSpec::new(SERVER, ResourceKind::Server)
            .with_attr("name", config.server_name())
            .with_attr("serverType", config.server_type.as_str())
            .with_attr("image", config.image.as_str())
            .with_attr("location", config.location.as_str())
            .with_deferred("sshKeys", Deferred::join_all(key_ids).map(Value::Array))
            .with_deferred("userData", user_data)
            // hcloud can only rename a server in place
            .with_policy(LifecyclePolicy::new().with_replace_triggers([
                "userData",
                "image",
                "serverType",
                "location",
                "sshKeys",
            ])),
    );

    set.add(
        ResourceSpec::new(ATTACHMENT, ResourceKind::VolumeAttachment)
            .with_deferred("serverId", Deferred::id(SERVER))
            .with_deferred("volumeId", Deferred::id(VOLUME))
            .with_attr("automount", config.automount)
            .with_policy(
                LifecyclePolicy::new()
                    .with_replace_triggers(["serverId", "volumeId", "automount"])
                    .with_delete_before_replace(),
            ),
    );

    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use bootflow_cloud::{AttrValue, DependencyGraph, OutputTable, ResourceOutputs};
    use serde_json::json;

    fn config(keys: usize) -> StackConfig {
        StackConfig {
            project: "demo".to_string(),
            ssh_keys: (0..keys).map(|i| format!("ssh-ed25519 AAAA{}", i)).collect(),
            ..StackConfig::default()
        }
    }

    fn vars(pairs: &[(&str, &str)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn deferred<'a>(set: &'a ResourceSet, resource: &str, attr: &str) -> &'a Deferred<Value> {
        match set.get(resource).and_then(|spec| spec.attributes.get(attr)) {
            Some(AttrValue::Deferred(value)) => value,
            other => panic!("{}.{} is not deferred: {:?}", resource, attr, other),
        }
    }

    #[test]
    fn test_render_user_data_volume_path_wins() {
        let template = Template::new("path=${BACKUP_VOLUME_PATH} user=${ USER }");
        let vars = vars(&[("USER", "app"), ("BACKUP_VOLUME_PATH", "/from/env")]);

        let text = render_user_data(&template, &vars, Some("/dev/sdb"));
        assert_eq!(text, "path=/dev/sdb user=app");

        let text = render_user_data(&template, &vars, None);
        assert_eq!(text, "path=/from/env user=app");
    }

    #[test]
    fn test_render_user_data_missing_is_empty() {
        let template = Template::new("path=${BACKUP_VOLUME_PATH};");
        assert_eq!(render_user_data(&template, &Variables::new(), None), "path=;");
    }

    #[test]
    fn test_build_declares_stack() {
        let set = build(&config(2), &Template::new(""), &Variables::new());

        assert_eq!(set.len(), 5);
        assert!(set.get("ssh-key-0").is_some());
        assert!(set.get("ssh-key-1").is_some());

        let volume = set.get(VOLUME).unwrap();
        assert!(volume.policy.protect);

        let attachment = set.get(ATTACHMENT).unwrap();
        assert!(attachment.policy.delete_before_replace);
        assert_eq!(
            attachment.dependencies().into_iter().collect::<Vec<_>>(),
            vec![VOLUME.to_string(), SERVER.to_string()]
        );
    }

    #[test]
    fn test_build_order() {
        let set = build(&config(1), &Template::new(""), &Variables::new());
        let graph = DependencyGraph::build(&set).unwrap();
        let order = graph.order();

        let position = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(position("ssh-key-0") < position(SERVER));
        assert!(position(VOLUME) < position(SERVER));
        assert!(position(SERVER) < position(ATTACHMENT));
    }

    #[test]
    fn test_user_data_waits_for_volume() {
        let template = Template::new("#cloud-config\nBACKUP_VOLUME_PATH=${BACKUP_VOLUME_PATH}\nTOKEN=${TOKEN}");
        let set = build(&config(0), &template, &vars(&[("TOKEN", "secret")]));
        let user_data = deferred(&set, SERVER, "userData");

        assert!(user_data.evaluate(&OutputTable::new()).is_err());

        let mut table = OutputTable::new();
        table.insert(
            VOLUME,
            ResourceOutputs::new("7").with_attribute("linux_device", json!("/dev/disk/by-id/vol-7")),
        );
        assert_eq!(
            user_data.evaluate(&table).unwrap(),
            json!("#cloud-config\nBACKUP_VOLUME_PATH=/dev/disk/by-id/vol-7\nTOKEN=secret")
        );
    }

    #[test]
    fn test_ssh_keys_follow_key_ids() {
        let set = build(&config(2), &Template::new(""), &Variables::new());
        let ssh_keys = deferred(&set, SERVER, "sshKeys");

        let mut table = OutputTable::new();
        table.insert("ssh-key-0", ResourceOutputs::new("11"));
        table.insert("ssh-key-1", ResourceOutputs::new("12"));
        assert_eq!(ssh_keys.evaluate(&table).unwrap(), json!(["11", "12"]));
    }

    #[test]
    fn test_no_keys_resolves_to_empty_list() {
        let set = build(&config(0), &Template::new(""), &Variables::new());
        let ssh_keys = deferred(&set, SERVER, "sshKeys");
        assert_eq!(ssh_keys.evaluate(&OutputTable::new()).unwrap(), json!([]));
    }
}
