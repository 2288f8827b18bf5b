use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use terradozer::provider::proto::tfplugin5;
use terradozer::provider::{ImportedResource, ProviderError};
use terradozer::schema::Schema;
use terradozer::{destroy_resources, ResourceProvider, State, Value};

const STATE_V4: &str = r#"{
    "version": 4,
    "terraform_version": "0.12.28",
    "resources": [
        {
            "mode": "managed",
            "type": "aws_vpc",
            "name": "main",
            "provider": "provider.aws",
            "instances": [
                {"attributes": {"id": "vpc-aaaa", "cidr_block": "10.0.0.0/16"}}
            ]
        },
        {
            "mode": "data",
            "type": "aws_ami",
            "name": "ubuntu",
            "provider": "provider.aws",
            "instances": [{"attributes": {"id": "ami-1234"}}]
        },
        {
            "mode": "managed",
            "type": "google_compute_instance",
            "name": "worker",
            "provider": "provider.google",
            "instances": [{"attributes": {"id": "worker-1"}}]
        }
    ]
}"#;

/// Provider double that records every call and destroys everything
/// successfully.
#[derive(Default)]
struct RecordingProvider {
    calls: Mutex<Vec<String>>,
}

impl RecordingProvider {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn schema() -> Schema {
        let attribute = |name: &str| tfplugin5::schema::Attribute {
            name: name.to_string(),
            r#type: b"\"string\"".to_vec(),
            description: String::new(),
            required: false,
            optional: true,
            computed: false,
            sensitive: false,
        };
        Schema::from_proto(&tfplugin5::Schema {
            version: 0,
            block: Some(tfplugin5::schema::Block {
                version: 0,
                attributes: vec![attribute("id"), attribute("cidr_block")],
                block_types: vec![],
            }),
        })
        .unwrap()
    }

    fn id_of(state: &Value) -> String {
        match state.attribute("id") {
            Some(Value::String(id)) => id.clone(),
            _ => String::new(),
        }
    }
}

#[async_trait]
impl ResourceProvider for RecordingProvider {
    fn schema_for_resource(&self, _type_name: &str) -> Result<Schema, ProviderError> {
        Ok(Self::schema())
    }

    async fn import_resource(
        &self,
        type_name: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("import {type_name} {id}"));
        Ok(vec![ImportedResource {
            type_name: type_name.to_string(),
            state: Value::Object(
                [("id".to_string(), Value::String(id.to_string()))]
                    .into_iter()
                    .collect(),
            ),
        }])
    }

    async fn read_resource(
        &self,
        type_name: &str,
        current_state: Value,
    ) -> Result<Value, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("read {type_name} {}", Self::id_of(&current_state)));
        Ok(current_state)
    }

    async fn destroy_resource(
        &self,
        type_name: &str,
        current_state: Value,
    ) -> Result<(), ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("destroy {type_name} {}", Self::id_of(&current_state)));
        Ok(())
    }
}

fn write_state(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

fn aws_only(provider: &Arc<RecordingProvider>) -> HashMap<String, Arc<RecordingProvider>> {
    [("aws".to_string(), Arc::clone(provider))]
        .into_iter()
        .collect()
}

#[tokio::test]
async fn test_state_binding_filters_data_and_unknown_providers() {
    let file = write_state(STATE_V4);
    let state = State::from_file(file.path()).unwrap();

    assert_eq!(state.provider_names(), vec!["aws", "google"]);

    // only aws is initialized; the google resource and the data source are
    // both dropped from the destroy set
    let provider = Arc::new(RecordingProvider::default());
    let resources = state.resources(&aws_only(&provider));
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].type_name(), "aws_vpc");
    assert_eq!(resources[0].id(), "vpc-aaaa");
}

#[tokio::test]
async fn test_dry_run_refreshes_but_does_not_destroy() {
    let file = write_state(STATE_V4);
    let state = State::from_file(file.path()).unwrap();
    let provider = Arc::new(RecordingProvider::default());

    let summary = destroy_resources(state.resources(&aws_only(&provider)), true, 1).await;

    assert_eq!(summary.deleted, 1);
    // the v4 attributes carry the state, so the refresh is a plain read
    assert_eq!(provider.calls(), vec!["read aws_vpc vpc-aaaa"]);
}

#[tokio::test]
async fn test_destroy_pass_issues_apply_for_each_resource() {
    let file = write_state(STATE_V4);
    let state = State::from_file(file.path()).unwrap();
    let provider = Arc::new(RecordingProvider::default());

    let summary = destroy_resources(state.resources(&aws_only(&provider)), false, 4).await;

    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.gone + summary.permanent_failures + summary.retries_exceeded, 0);
    assert_eq!(
        provider.calls(),
        vec!["read aws_vpc vpc-aaaa", "destroy aws_vpc vpc-aaaa"]
    );
}
