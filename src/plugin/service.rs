//! The tfplugin6 `Provider` service.
//!
//! Every RPC reports failures as diagnostics in its response; gRPC status
//! errors are reserved for requests that cannot be decoded at all.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::RwLock;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use super::codec::{self, attribute_path};
use super::diagnostics::{self, Finding};
use super::tfplugin6::provider_server::Provider;
use super::tfplugin6::*;
use crate::client::Client;
use crate::config::{provider_schema, ProcessEnv, ProviderBlock};
use crate::error::ProviderError;
use crate::plan::{plan_change, Action};
use crate::resources::{self, Resource};

pub struct ProviderService {
    resources: HashMap<&'static str, Box<dyn Resource>>,
    client: RwLock<Option<Arc<Client>>>,
}

impl Default for ProviderService {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderService {
    pub fn new() -> Self {
        let resources = resources::all()
            .into_iter()
            .map(|r| (r.type_name(), r))
            .collect();
        Self {
            resources,
            client: RwLock::new(None),
        }
    }

    fn resource(&self, type_name: &str) -> Result<&dyn Resource, ProviderError> {
        self.resources
            .get(type_name)
            .map(|r| r.as_ref())
            .ok_or_else(|| ProviderError::UnknownResourceType(type_name.to_string()))
    }

    async fn client(&self) -> Result<Arc<Client>> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| ProviderError::NotConfigured.into())
    }

    /// Sorted resource type names.
    pub fn resource_types(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.resources.keys().copied().collect();
        names.sort_unstable();
        names
    }

    fn capabilities() -> ServerCapabilities {
        ServerCapabilities {
            plan_destroy: true,
            get_provider_schema_optional: false,
            move_resource_state: false,
        }
    }

    /// Conform a JSON state to the resource schema and encode it. Null stays null.
    fn encode_state(resource: &dyn Resource, state: &Value) -> Result<DynamicValue> {
        if state.is_null() {
            return codec::encode(&Value::Null);
        }
        codec::encode(&resource.schema().conform(state))
    }

    // ─── RPC Bodies ──────────────────────────────────────────────────────────

    async fn configure(&self, config: Option<&DynamicValue>) -> Result<()> {
        let block = ProviderBlock::from_value(&codec::decode(config)?)?;
        let resolved = block.resolve(&ProcessEnv);
        let client = Client::new(resolved)
            .await
            .context("Failed to configure PostgreSQL client")?;
        *self.client.write().await = Some(Arc::new(client));
        Ok(())
    }

    async fn read_state(&self, type_name: &str, current: Option<&DynamicValue>) -> Result<DynamicValue> {
        let resource = self.resource(type_name)?;
        let state = codec::decode(current)?;
        if state.is_null() {
            return codec::encode(&Value::Null);
        }
        let client = self.client().await?;

        if !resource.exists(&client, &state).await? {
            info!(resource = type_name, "Object no longer exists, removing from state");
            return codec::encode(&Value::Null);
        }
        match resource.read(&client, &state).await? {
            Some(current) => Self::encode_state(resource, &current),
            None => {
                info!(resource = type_name, "Object no longer exists, removing from state");
                codec::encode(&Value::Null)
            }
        }
    }

    fn plan(
        &self,
        request: &plan_resource_change::Request,
    ) -> Result<plan_resource_change::Response> {
        let resource = self.resource(&request.type_name)?;
        let block = resource.schema();
        let prior = codec::decode_raw(request.prior_state.as_ref())?;
        let proposed = codec::decode_raw(request.proposed_new_state.as_ref())?;
        let config = codec::decode_raw(request.config.as_ref())?;

        let change = plan_change(&block, &prior, &proposed, &config);
        debug!(
            resource = %request.type_name,
            action = ?change.action,
            requires_replace = ?change.requires_replace,
            "Planned resource change"
        );

        Ok(plan_resource_change::Response {
            planned_state: Some(codec::encode_raw(&change.planned_state)?),
            requires_replace: change
                .requires_replace
                .iter()
                .map(|name| attribute_path(name))
                .collect(),
            planned_private: request.prior_private.clone(),
            diagnostics: vec![],
            legacy_type_system: true,
        })
    }

    async fn apply(&self, request: &apply_resource_change::Request) -> Result<Value> {
        let resource = self.resource(&request.type_name)?;
        let prior = codec::decode(request.prior_state.as_ref())?;
        let planned = codec::decode(request.planned_state.as_ref())?;
        let client = self.client().await?;

        let action = match (prior.is_null(), planned.is_null()) {
            (_, true) => Action::Delete,
            (true, false) => Action::Create,
            (false, false) => Action::Update,
        };
        info!(resource = %request.type_name, action = ?action, "Applying resource change");

        match action {
            Action::Delete => {
                resource.delete(&client, &prior).await?;
                Ok(Value::Null)
            }
            Action::Create => resource.create(&client, &planned).await,
            _ => resource.update(&client, &prior, &planned).await,
        }
    }

    fn upgrade(&self, request: &upgrade_resource_state::Request) -> Result<DynamicValue> {
        let resource = self.resource(&request.type_name)?;
        let raw = request
            .raw_state
            .as_ref()
            .map(|raw| raw.json.as_slice())
            .unwrap_or_default();
        if raw.is_empty() {
            return codec::encode(&Value::Null);
        }
        // Schema version 0 everywhere: upgrading is re-shaping to the schema.
        let state: Value = serde_json::from_slice(raw).context("Failed to decode stored state")?;
        Self::encode_state(resource, &state)
    }

    async fn import(&self, type_name: &str, id: &str) -> Result<Option<Value>> {
        let resource = self.resource(type_name)?;
        let seed = resource.import_state(id)?;
        let client = self.client().await?;
        resource
            .read(&client, &seed)
            .await
            .with_context(|| format!("Failed to import {} {:?}", type_name, id))
    }
}

fn validation_diagnostics(findings: Vec<Finding>) -> Vec<Diagnostic> {
    findings.into_iter().map(Diagnostic::from).collect()
}

fn error_diagnostics(err: &anyhow::Error) -> Vec<Diagnostic> {
    warn!(error = %format!("{:#}", err), "Request failed");
    vec![diagnostics::from_error(err)]
}

#[tonic::async_trait]
impl Provider for ProviderService {
    async fn get_metadata(
        &self,
        _request: Request<get_metadata::Request>,
    ) -> Result<Response<get_metadata::Response>, Status> {
        Ok(Response::new(get_metadata::Response {
            server_capabilities: Some(Self::capabilities()),
            diagnostics: vec![],
            data_sources: vec![],
            resources: self
                .resource_types()
                .into_iter()
                .map(|name| get_metadata::ResourceMetadata {
                    type_name: name.to_string(),
                })
                .collect(),
        }))
    }

    async fn get_provider_schema(
        &self,
        _request: Request<get_provider_schema::Request>,
    ) -> Result<Response<get_provider_schema::Response>, Status> {
        let resource_schemas = self
            .resources
            .iter()
            .map(|(name, r)| (name.to_string(), r.schema().to_schema()))
            .collect();
        Ok(Response::new(get_provider_schema::Response {
            provider: Some(provider_schema().to_schema()),
            resource_schemas,
            data_source_schemas: HashMap::new(),
            diagnostics: vec![],
            provider_meta: None,
            server_capabilities: Some(Self::capabilities()),
        }))
    }

    async fn validate_provider_config(
        &self,
        request: Request<validate_provider_config::Request>,
    ) -> Result<Response<validate_provider_config::Response>, Status> {
        let request = request.into_inner();
        let diagnostics = match codec::decode(request.config.as_ref())
            .and_then(|config| ProviderBlock::from_value(&config))
        {
            Ok(block) => validation_diagnostics(block.validate()),
            Err(err) => error_diagnostics(&err),
        };
        Ok(Response::new(validate_provider_config::Response { diagnostics }))
    }

    async fn validate_resource_config(
        &self,
        request: Request<validate_resource_config::Request>,
    ) -> Result<Response<validate_resource_config::Response>, Status> {
        let request = request.into_inner();
        let result = self
            .resource(&request.type_name)
            .map_err(anyhow::Error::from)
            .and_then(|resource| {
                let config = codec::decode(request.config.as_ref())?;
                Ok(resource.validate(&config))
            });
        let diagnostics = match result {
            Ok(findings) => validation_diagnostics(findings),
            Err(err) => error_diagnostics(&err),
        };
        Ok(Response::new(validate_resource_config::Response { diagnostics }))
    }

    async fn validate_data_resource_config(
        &self,
        request: Request<validate_data_resource_config::Request>,
    ) -> Result<Response<validate_data_resource_config::Response>, Status> {
        let type_name = request.into_inner().type_name;
        let err = anyhow::anyhow!("unknown data source type: {}", type_name);
        Ok(Response::new(validate_data_resource_config::Response {
            diagnostics: error_diagnostics(&err),
        }))
    }

    async fn upgrade_resource_state(
        &self,
        request: Request<upgrade_resource_state::Request>,
    ) -> Result<Response<upgrade_resource_state::Response>, Status> {
        let request = request.into_inner();
        let (upgraded_state, diagnostics) = match self.upgrade(&request) {
            Ok(state) => (Some(state), vec![]),
            Err(err) => (None, error_diagnostics(&err)),
        };
        Ok(Response::new(upgrade_resource_state::Response {
            upgraded_state,
            diagnostics,
        }))
    }

    async fn configure_provider(
        &self,
        request: Request<configure_provider::Request>,
    ) -> Result<Response<configure_provider::Response>, Status> {
        let request = request.into_inner();
        info!(terraform_version = %request.terraform_version, "Configuring provider");
        let diagnostics = match self.configure(request.config.as_ref()).await {
            Ok(()) => vec![],
            Err(err) => error_diagnostics(&err),
        };
        Ok(Response::new(configure_provider::Response { diagnostics }))
    }

    async fn read_resource(
        &self,
        request: Request<read_resource::Request>,
    ) -> Result<Response<read_resource::Response>, Status> {
        let request = request.into_inner();
        let (new_state, diagnostics) = match self
            .read_state(&request.type_name, request.current_state.as_ref())
            .await
        {
            Ok(state) => (Some(state), vec![]),
            // Keep the current state so a transient failure does not drop it.
            Err(err) => (request.current_state.clone(), error_diagnostics(&err)),
        };
        Ok(Response::new(read_resource::Response {
            new_state,
            diagnostics,
            private: request.private,
        }))
    }

    async fn plan_resource_change(
        &self,
        request: Request<plan_resource_change::Request>,
    ) -> Result<Response<plan_resource_change::Response>, Status> {
        let request = request.into_inner();
        let response = match self.plan(&request) {
            Ok(response) => response,
            Err(err) => plan_resource_change::Response {
                planned_state: request.proposed_new_state.clone(),
                requires_replace: vec![],
                planned_private: request.prior_private.clone(),
                diagnostics: error_diagnostics(&err),
                legacy_type_system: true,
            },
        };
        Ok(Response::new(response))
    }

    async fn apply_resource_change(
        &self,
        request: Request<apply_resource_change::Request>,
    ) -> Result<Response<apply_resource_change::Response>, Status> {
        let request = request.into_inner();
        let outcome = match self.apply(&request).await {
            Ok(state) => self
                .resource(&request.type_name)
                .map_err(anyhow::Error::from)
                .and_then(|resource| Self::encode_state(resource, &state)),
            Err(err) => Err(err),
        };

        let (new_state, diagnostics) = match outcome {
            Ok(state) => (Some(state), vec![]),
            Err(err) => {
                // A failed create leaves nothing behind; anything else keeps
                // the prior state so the object stays tracked.
                let prior_is_null = codec::decode_raw(request.prior_state.as_ref())
                    .map(|v| codec::is_null(&v))
                    .unwrap_or(true);
                let state = if prior_is_null {
                    codec::encode(&Value::Null).ok()
                } else {
                    request.prior_state.clone()
                };
                (state, error_diagnostics(&err))
            }
        };
        Ok(Response::new(apply_resource_change::Response {
            new_state,
            private: request.planned_private,
            diagnostics,
            legacy_type_system: true,
        }))
    }

    async fn import_resource_state(
        &self,
        request: Request<import_resource_state::Request>,
    ) -> Result<Response<import_resource_state::Response>, Status> {
        let request = request.into_inner();
        let result = match self.import(&request.type_name, &request.id).await {
            Ok(Some(state)) => self
                .resource(&request.type_name)
                .map_err(anyhow::Error::from)
                .and_then(|resource| Self::encode_state(resource, &state)),
            Ok(None) => Err(anyhow::anyhow!(
                "Cannot import non-existent remote object {} {:?}",
                request.type_name,
                request.id
            )),
            Err(err) => Err(err),
        };

        let response = match result {
            Ok(state) => import_resource_state::Response {
                imported_resources: vec![import_resource_state::ImportedResource {
                    type_name: request.type_name,
                    state: Some(state),
                    private: vec![],
                }],
                diagnostics: vec![],
            },
            Err(err) => import_resource_state::Response {
                imported_resources: vec![],
                diagnostics: error_diagnostics(&err),
            },
        };
        Ok(Response::new(response))
    }

    async fn read_data_source(
        &self,
        request: Request<read_data_source::Request>,
    ) -> Result<Response<read_data_source::Response>, Status> {
        let type_name = request.into_inner().type_name;
        let err = anyhow::anyhow!("unknown data source type: {}", type_name);
        Ok(Response::new(read_data_source::Response {
            state: None,
            diagnostics: error_diagnostics(&err),
        }))
    }

    async fn stop_provider(
        &self,
        _request: Request<stop_provider::Request>,
    ) -> Result<Response<stop_provider::Response>, Status> {
        // Handlers hold no cancellable work beyond the in-flight statement.
        info!("Stop requested by host");
        Ok(Response::new(stop_provider::Response {
            error: String::new(),
        }))
    }
}
