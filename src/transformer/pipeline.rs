// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! The render pipeline: discovers the objects connected to a trigger,
//! orders them, resolves per-object context, renders template and copy
//! operations into a scratch tree and composes the tree into the desired
//! resource set.

use std::sync::Arc;

use handlebars::{
    Context, Handlebars, Helper, HelperDef, RenderContext, RenderError, RenderErrorReason,
    ScopedJson,
};
use kube::api::DynamicObject;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::api::KindRef;
use crate::cluster::ClusterClient;
use crate::dynamic;
use crate::error::{Error, Result};
use crate::transformer::compose::{Composer, ROOT_MANIFEST};
use crate::transformer::finder;
use crate::transformer::functions;
use crate::transformer::registry::IntegrationRegistry;
use crate::transformer::sort;
use crate::transformer::vfs::{base_name, join_path, FsProvider, MemoryFileSystem, VirtualFileSystem};

const TARGET_ROOT: &str = "tmp";
const APPLY_SOURCE: &str = "embedded:/v1/apply";
const APPLY_TEMPLATE: &str = "apply.yaml";

// Composition-layer files are reserved and skipped during traversal.
const RESERVED_BASENAMES: [&str; 3] = ["kustomization.yaml", "kustomization.yml", "Kustomization"];

const MODEL_DATA_KIND: &str = "ModelData";
const MODEL_DATA_GROUP: &str = "loom.dev";
const MODEL_DATA_VERSION: &str = "v1";

/// Reads a `ModelData` document and derives the rendered model argument.
/// Every failure is retriable: the ModelData may simply not be ready yet.
pub async fn resolve_model_data(
    cluster: &Arc<dyn ClusterClient>,
    namespace: &str,
    name: &str,
) -> Result<Value> {
    let kind = KindRef::new(MODEL_DATA_GROUP, MODEL_DATA_VERSION, MODEL_DATA_KIND);
    let model_data = cluster
        .get(&kind, namespace, name)
        .await?
        .ok_or_else(|| Error::ModelDataMissing(name.to_string()))?;

    let phase = dynamic::nested_str(&model_data.data, &["status", "phase"])
        .unwrap_or_default()
        .to_string();
    if phase != "Succeeded" {
        return Err(Error::ModelDataNotReady {
            name: name.to_string(),
            phase,
        });
    }

    let final_path = dynamic::nested_str(&model_data.data, &["status", "finalGcsPath"])
        .unwrap_or_default()
        .to_string();
    if final_path.is_empty() {
        return Err(Error::ModelDataPathMissing(name.to_string()));
    }

    let model_dir = functions::blob_path_from_uri(&final_path).unwrap_or_default();
    Ok(serde_json::json!({
        "modelArg": format!("--model=/data/{model_dir}"),
        "gcsPath": final_path,
    }))
}

// Bridges the synchronous template engine to the async cluster read. Only
// valid on a multi-threaded runtime, which the operator always runs on.
struct ResolveModelDataHelper {
    cluster: Arc<dyn ClusterClient>,
}

impl HelperDef for ResolveModelDataHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> std::result::Result<ScopedJson<'rc>, RenderError> {
        let namespace = h
            .param(0)
            .and_then(|p| p.value().as_str())
            .unwrap_or_default()
            .to_string();
        let name = h
            .param(1)
            .and_then(|p| p.value().as_str())
            .unwrap_or_default()
            .to_string();
        let cluster = self.cluster.clone();
        let resolved = tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current()
                .block_on(resolve_model_data(&cluster, &namespace, &name))
        })
        .map_err(|err| RenderError::from(RenderErrorReason::Other(err.to_string())))?;
        Ok(ScopedJson::Derived(resolved))
    }
}

pub struct Transformer {
    registry: Arc<IntegrationRegistry>,
    fs_provider: Arc<dyn FsProvider>,
    composer: Arc<dyn Composer>,
}

impl Transformer {
    pub fn new(
        registry: Arc<IntegrationRegistry>,
        fs_provider: Arc<dyn FsProvider>,
        composer: Arc<dyn Composer>,
    ) -> Self {
        Transformer {
            registry,
            fs_provider,
            composer,
        }
    }

    pub fn registry(&self) -> &Arc<IntegrationRegistry> {
        &self.registry
    }

    /// Produces the desired resource set for one trigger object.
    pub async fn run(
        &self,
        cluster: &Arc<dyn ClusterClient>,
        trigger: &DynamicObject,
    ) -> Result<Vec<DynamicObject>> {
        let trigger_kind = dynamic::kind_ref_of(trigger);
        if !self.registry.has(&trigger_kind) {
            return Err(Error::MissingIntegration(trigger_kind.to_string()));
        }

        let related = finder::find_connected_resources(cluster, &self.registry, trigger).await?;
        let mut accumulator = vec![trigger.clone()];
        accumulator.extend(related.referenced);
        accumulator.extend(related.referencing);
        let ordered = sort::topological_sort(&self.registry, accumulator)?;

        let mut resource_map = Map::new();
        for resource in &ordered {
            let key = format!("{}/{}", dynamic::kind_ref_of(resource).kind, dynamic::name_of(resource));
            debug!(key = %key, "adding resource to template map");
            resource_map.insert(key, dynamic::full_value(resource));
        }

        let scratch = MemoryFileSystem::new();
        scratch.mkdir_all(TARGET_ROOT)?;

        let mut engine = functions::engine();
        engine.register_helper(
            "resolveModelData",
            Box::new(ResolveModelDataHelper {
                cluster: cluster.clone(),
            }),
        );

        let mut context = Map::new();
        context.insert("root".into(), Value::String(TARGET_ROOT.into()));
        context.insert("chain".into(), Value::String(String::new()));
        context.insert("resource".into(), Value::Null);
        context.insert("resources".into(), Value::Object(resource_map));

        let trigger_rules = self.registry.reference_rules(&trigger_kind);
        let trigger_uid = dynamic::uid_of(trigger);
        let mut resource_files: Vec<String> = Vec::new();
        let mut last_template_chain = String::new();

        for resource in &ordered {
            let resource_kind = dynamic::kind_ref_of(resource);
            context.insert("chain".into(), Value::String(last_template_chain.clone()));
            context.insert("resource".into(), dynamic::full_value(resource));

            let target_relative =
                join_path(&dynamic::namespace_of(resource), &dynamic::name_of(resource));
            let target_object_path = join_path(TARGET_ROOT, &target_relative);

            self.registry.resolve_context(resource, &mut context).await?;

            let run_templates = dynamic::uid_of(resource) == trigger_uid
                || trigger_rules.iter().any(|rule| {
                    rule.group == resource_kind.group
                        && rule.kind == resource_kind.kind
                        && rule.propagate_templates
                });
            if !run_templates {
                info!(
                    kind = %resource_kind.kind,
                    name = %dynamic::name_of(resource),
                    "skipping template execution for read-only reference"
                );
                continue;
            }

            for copy_path in self.registry.copy_paths(&resource_kind) {
                let (source_fs, root_path) = self.fs_provider.resolve(&copy_path).await?;
                source_fs.walk(&root_path, &mut |source_path, is_dir| {
                    if is_dir || RESERVED_BASENAMES.contains(&base_name(source_path)) {
                        return Ok(());
                    }
                    let target_path = join_path(&target_object_path, source_path);
                    resource_files.push(join_path(&target_relative, source_path));
                    scratch.write_file(&target_path, &source_fs.read_file(source_path)?)
                })?;
            }

            for template_path in self.registry.template_paths(&resource_kind) {
                let (source_fs, root_path) = self.fs_provider.resolve(&template_path).await?;
                source_fs.walk(&root_path, &mut |source_path, is_dir| {
                    if is_dir || RESERVED_BASENAMES.contains(&base_name(source_path)) {
                        return Ok(());
                    }
                    let target_path = join_path(&target_object_path, source_path);
                    resource_files.push(join_path(&target_relative, source_path));
                    let raw = source_fs.read_file(source_path)?;
                    let rendered = engine
                        .render_template(
                            &String::from_utf8_lossy(&raw),
                            &Value::Object(context.clone()),
                        )
                        .map_err(|source| Error::TemplateRender {
                            path: source_path.to_string(),
                            source: Box::new(source),
                        })?;
                    scratch.write_file(&target_path, rendered.as_bytes())
                })?;
                last_template_chain = join_path(&target_relative, &root_path);
            }
        }

        if resource_files.is_empty() {
            info!("no resource files were generated, skipping composition");
            return Ok(Vec::new());
        }

        let (apply_fs, apply_root) = self.fs_provider.resolve(APPLY_SOURCE).await?;
        let apply_path = join_path(&apply_root, APPLY_TEMPLATE);
        let raw = apply_fs.read_file(&apply_path)?;
        let manifest = engine
            .render_template(
                &String::from_utf8_lossy(&raw),
                &Value::Array(resource_files.iter().cloned().map(Value::String).collect()),
            )
            .map_err(|source| Error::TemplateRender {
                path: apply_path.clone(),
                source: Box::new(source),
            })?;
        scratch.write_file(&join_path(TARGET_ROOT, ROOT_MANIFEST), manifest.as_bytes())?;

        let mut composed = self.composer.compose(&scratch, TARGET_ROOT)?;
        for obj in &mut composed {
            fix_secret_data(obj)?;
        }
        Ok(composed)
    }
}

/// The composition engine can emit a Secret whose `data` block collapsed
/// into a scalar `"key: value"` string; re-expand it into a dictionary.
fn fix_secret_data(obj: &mut DynamicObject) -> Result<()> {
    let is_secret = obj
        .types
        .as_ref()
        .map(|t| t.kind == "Secret")
        .unwrap_or(false);
    if !is_secret {
        return Ok(());
    }
    let Some(scalar) = obj.data.get("data").and_then(Value::as_str).map(str::to_string) else {
        return Ok(());
    };
    match scalar.split_once(':') {
        Some((key, value)) => {
            let mut map = Map::new();
            map.insert(
                key.trim().to_string(),
                Value::String(value.trim().to_string()),
            );
            obj.data["data"] = Value::Object(map);
            Ok(())
        }
        None => Err(Error::SecretDataParse {
            name: dynamic::name_of(obj),
            value: scalar,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        entry_for, obj, with_copy, with_reference, with_template, FakeCluster, StubFsProvider,
        StubProbeClient,
    };
    use crate::transformer::compose::OverlayComposer;
    use serde_json::json;

    const APPLY_CONTENT: &str = "resources:\n{{#each this}}- {{this}}\n{{/each}}";

    fn stub_provider_with_apply() -> StubFsProvider {
        let provider = StubFsProvider::default();
        let apply_fs = MemoryFileSystem::new();
        apply_fs
            .write_file("v1/apply/apply.yaml", APPLY_CONTENT.as_bytes())
            .unwrap();
        provider.route(APPLY_SOURCE, Arc::new(apply_fs), "v1/apply");
        provider
    }

    fn transformer_with(
        entries: Vec<crate::api::IntegrationEntry>,
        provider: StubFsProvider,
    ) -> Transformer {
        let registry = IntegrationRegistry::new(Arc::new(StubProbeClient::default()));
        registry.set_snapshot(entries).unwrap();
        Transformer::new(
            Arc::new(registry),
            Arc::new(provider),
            Arc::new(OverlayComposer),
        )
    }

    fn cluster_with(objects: &[DynamicObject]) -> Arc<dyn ClusterClient> {
        let cluster = FakeCluster::default();
        for object in objects {
            cluster.insert(object);
        }
        cluster.into_arc()
    }

    #[tokio::test]
    async fn renders_a_simple_template_into_one_desired_object() {
        let kind = KindRef::new("testing.loom.dev", "v1", "TestResource");
        let template_fs = MemoryFileSystem::new();
        template_fs
            .write_file(
                "templates/my-integration/deployment.yaml",
                b"apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {{resource.metadata.name}}-deployment\n  namespace: {{resource.metadata.namespace}}\nspec:\n  replicas: 1\n",
            )
            .unwrap();
        let provider = stub_provider_with_apply();
        provider.route(
            "embedded:/templates/my-integration",
            Arc::new(template_fs),
            "templates/my-integration",
        );

        let transformer = transformer_with(
            vec![with_template(
                entry_for(&kind),
                "embedded:/templates/my-integration",
            )],
            provider,
        );

        let trigger = obj(&kind, "test-ns", "test-resource");
        let cluster = cluster_with(&[trigger.clone()]);
        let result = transformer.run(&cluster, &trigger).await.unwrap();

        assert_eq!(result.len(), 1);
        let deployment = &result[0];
        assert_eq!(deployment.types.as_ref().unwrap().kind, "Deployment");
        assert_eq!(dynamic::name_of(deployment), "test-resource-deployment");
        assert_eq!(dynamic::namespace_of(deployment), "test-ns");
    }

    #[tokio::test]
    async fn copies_static_manifests_verbatim() {
        let kind = KindRef::new("loom.dev", "v1", "Endpoint");
        let copy_fs = MemoryFileSystem::new();
        copy_fs
            .write_file(
                "integrations/endpoint/base/copied-configmap.yaml",
                b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: copied-from-source\n  namespace: copy-ns\ndata:\n  sourcePath: integrations/endpoint/base\n",
            )
            .unwrap();
        // Reserved composition files in the source tree must not be copied.
        copy_fs
            .write_file("integrations/endpoint/base/kustomization.yaml", b"resources: []\n")
            .unwrap();
        let provider = stub_provider_with_apply();
        provider.route(
            "embedded:/integrations/endpoint/base",
            Arc::new(copy_fs),
            "integrations/endpoint/base",
        );

        let transformer = transformer_with(
            vec![with_copy(
                entry_for(&kind),
                "embedded:/integrations/endpoint/base",
            )],
            provider,
        );

        let trigger = obj(&kind, "copy-ns", "copy-resource");
        let cluster = cluster_with(&[trigger.clone()]);
        let result = transformer.run(&cluster, &trigger).await.unwrap();

        assert_eq!(result.len(), 1);
        let config_map = &result[0];
        assert_eq!(config_map.types.as_ref().unwrap().kind, "ConfigMap");
        assert_eq!(dynamic::name_of(config_map), "copied-from-source");
        assert_eq!(dynamic::namespace_of(config_map), "copy-ns");
        assert_eq!(
            config_map.data["data"]["sourcePath"],
            "integrations/endpoint/base"
        );
    }

    #[tokio::test]
    async fn references_without_propagation_render_only_the_trigger() {
        let endpoint = KindRef::new("loom.dev", "v1", "Endpoint");
        let monitor = KindRef::new("loom.dev", "v1", "Monitor");

        let endpoint_fs = MemoryFileSystem::new();
        endpoint_fs
            .write_file(
                "v1/endpoint/endpoint.yaml",
                b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{resource.metadata.name}}-endpoint\n  namespace: default\n",
            )
            .unwrap();
        let monitor_fs = MemoryFileSystem::new();
        monitor_fs
            .write_file(
                "v1/monitor/monitor.yaml",
                b"apiVersion: monitoring.googleapis.com/v1\nkind: PodMonitoring\nmetadata:\n  name: {{resource.metadata.name}}-monitor\n  namespace: default\n",
            )
            .unwrap();

        let provider = stub_provider_with_apply();
        provider.route("embedded:/v1/endpoint", Arc::new(endpoint_fs), "v1/endpoint");
        provider.route("embedded:/v1/monitor", Arc::new(monitor_fs), "v1/monitor");

        let transformer = transformer_with(
            vec![
                with_template(entry_for(&endpoint), "embedded:/v1/endpoint"),
                with_template(
                    with_reference(entry_for(&monitor), &endpoint, "spec.endpoint.name", false),
                    "embedded:/v1/monitor",
                ),
            ],
            provider,
        );

        let e1 = obj(&endpoint, "default", "e1");
        let mut m1 = obj(&monitor, "default", "m1");
        m1.data["spec"] = json!({"endpoint": {"name": "e1"}});
        let cluster = cluster_with(&[e1, m1.clone()]);

        let result = transformer.run(&cluster, &m1).await.unwrap();
        // e1 is ordered before m1 but its templates do not run: the rule does
        // not propagate. Only the monitor's child is emitted.
        assert_eq!(result.len(), 1);
        assert_eq!(dynamic::name_of(&result[0]), "m1-monitor");
    }

    #[tokio::test]
    async fn missing_integration_fails_fast() {
        let kind = KindRef::new("loom.dev", "v1", "Unregistered");
        let transformer = transformer_with(vec![], stub_provider_with_apply());
        let trigger = obj(&kind, "default", "x");
        let cluster = cluster_with(&[trigger.clone()]);
        let err = transformer.run(&cluster, &trigger).await.unwrap_err();
        assert!(matches!(err, Error::MissingIntegration(_)));
    }

    #[tokio::test]
    async fn unknown_scheme_fails_before_any_file_is_written() {
        let kind = KindRef::new("loom.dev", "v1", "Endpoint");
        let transformer = transformer_with(
            vec![with_template(entry_for(&kind), "ftp:/weird/path")],
            stub_provider_with_apply(),
        );
        let trigger = obj(&kind, "default", "e1");
        let cluster = cluster_with(&[trigger.clone()]);
        assert!(transformer.run(&cluster, &trigger).await.is_err());
    }

    #[tokio::test]
    async fn no_generated_files_yield_an_empty_desired_set() {
        let kind = KindRef::new("loom.dev", "v1", "Endpoint");
        let transformer = transformer_with(vec![entry_for(&kind)], stub_provider_with_apply());
        let trigger = obj(&kind, "default", "e1");
        let cluster = cluster_with(&[trigger.clone()]);
        let result = transformer.run(&cluster, &trigger).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn scalar_secret_data_is_reexpanded_into_a_dictionary() {
        let mut secret: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "hf"},
            "data": "hf_token: dG9rZW4="
        }))
        .unwrap();
        fix_secret_data(&mut secret).unwrap();
        assert_eq!(secret.data["data"]["hf_token"], "dG9rZW4=");

        let mut broken: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "hf"},
            "data": "no-separator"
        }))
        .unwrap();
        assert!(fix_secret_data(&mut broken).is_err());
    }

    #[tokio::test]
    async fn rerendering_the_same_inputs_is_byte_stable() {
        let kind = KindRef::new("testing.loom.dev", "v1", "TestResource");
        let template_fs: Arc<dyn VirtualFileSystem> = {
            let fs = MemoryFileSystem::new();
            fs.write_file(
                "t/deployment.yaml",
                b"apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {{resource.metadata.name}}-deployment\n  namespace: {{resource.metadata.namespace}}\n",
            )
            .unwrap();
            Arc::new(fs)
        };

        let mut outputs = Vec::new();
        for _ in 0..2 {
            let provider = stub_provider_with_apply();
            provider.route("embedded:/t", template_fs.clone(), "t");
            let transformer =
                transformer_with(vec![with_template(entry_for(&kind), "embedded:/t")], provider);
            let trigger = obj(&kind, "test-ns", "test-resource");
            let cluster = cluster_with(&[trigger.clone()]);
            let result = transformer.run(&cluster, &trigger).await.unwrap();
            outputs.push(serde_json::to_string(&result).unwrap());
        }
        assert_eq!(outputs[0], outputs[1]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_model_data_helper_renders_model_arguments() {
        let model_data_kind = KindRef::new("loom.dev", "v1", "ModelData");
        let kind = KindRef::new("loom.dev", "v1", "Endpoint");

        let template_fs = MemoryFileSystem::new();
        template_fs
            .write_file(
                "t/job.yaml",
                b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{resource.metadata.name}}-model\n  namespace: default\ndata:\n  arg: '{{#with (resolveModelData \"default\" \"weights\")}}{{modelArg}}{{/with}}'\n",
            )
            .unwrap();
        let provider = stub_provider_with_apply();
        provider.route("embedded:/t", Arc::new(template_fs), "t");

        let transformer =
            transformer_with(vec![with_template(entry_for(&kind), "embedded:/t")], provider);

        let mut model_data = obj(&model_data_kind, "default", "weights");
        model_data.data["status"] = json!({
            "phase": "Succeeded",
            "finalGcsPath": "gs://my-bucket/models/llama/abc123"
        });
        let trigger = obj(&kind, "default", "e1");
        let cluster = cluster_with(&[trigger.clone(), model_data]);

        let result = transformer.run(&cluster, &trigger).await.unwrap();
        assert_eq!(
            result[0].data["data"]["arg"],
            "--model=/data/models/llama/abc123"
        );
    }

    #[tokio::test]
    async fn resolve_model_data_waits_for_succeeded_phase() {
        let model_data_kind = KindRef::new("loom.dev", "v1", "ModelData");
        let fake = FakeCluster::default();
        let mut model_data = obj(&model_data_kind, "default", "weights");
        model_data.data["status"] = json!({"phase": "Syncing"});
        fake.insert(&model_data);
        let cluster = fake.into_arc();

        let err = resolve_model_data(&cluster, "default", "weights")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelDataNotReady { .. }));

        let err = resolve_model_data(&cluster, "default", "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelDataMissing(_)));
    }
}
