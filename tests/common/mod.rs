#![allow(dead_code)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Container, ContainerState, ContainerStateTerminated, ContainerStatus, Pod, PodSpec, PodStatus,
    ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;

use kube_appwrapper::crd::{
    AppWrapper, AppWrapperComponent, AppWrapperPodSet, AppWrapperSpec,
};

pub fn t(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).expect("valid timestamp")
}

pub fn make_pod(name: &str, phase: &str, node: Option<&str>, gpus: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("batch".to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: node.map(str::to_string),
            containers: vec![Container {
                name: "main".to_string(),
                image: Some("app:1.0".to_string()),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([
                        ("cpu".to_string(), Quantity("100m".to_string())),
                        ("nvidia.com/gpu".to_string(), Quantity(gpus.to_string())),
                    ])),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

pub fn with_exit_code(mut pod: Pod, code: i32) -> Pod {
    pod.status
        .get_or_insert_with(Default::default)
        .container_statuses = Some(vec![ContainerStatus {
        name: "main".to_string(),
        state: Some(ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: code,
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }]);
    pod
}

pub fn pod_component(name: &str, gpus: &str) -> AppWrapperComponent {
    AppWrapperComponent {
        template: json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": name},
            "spec": {"containers": [{
                "name": "main",
                "image": "app:1.0",
                "resources": {"requests": {"cpu": "100m", "nvidia.com/gpu": gpus}}
            }]}
        }),
        declared_pod_sets: vec![AppWrapperPodSet::new("template", Some(1))],
        ..Default::default()
    }
}

pub fn make_wrapper(name: &str, components: Vec<AppWrapperComponent>) -> AppWrapper {
    let mut aw = AppWrapper::new(
        name,
        AppWrapperSpec {
            suspend: true,
            managed_by: None,
            components,
        },
    );
    aw.metadata.namespace = Some("batch".to_string());
    aw.metadata.uid = Some("uid-test".to_string());
    aw
}
