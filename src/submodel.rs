use crate::correlation::ResponseStore;
use crate::definition::{meta_property_definition, MetaDescriptor, SubmodelDescriptor};
use crate::event::Event;
use crate::operation::{InvocationSettings, Operation};
use crate::property::Property;
use crate::topic::{self, META_ELEMENT};
use crate::transport::Transport;
use crate::{Error, Mode};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// What every element of one asset handle is created with.
#[derive(Clone)]
pub(crate) struct BindContext {
    pub namespace: String,
    pub asset_name: String,
    pub mode: Mode,
    pub transport: Arc<dyn Transport>,
    pub responses: Arc<ResponseStore>,
    pub invocation: InvocationSettings,
}

/// A descriptor bound to an asset: its properties, operations and events,
/// plus the synthesized `_meta` property.
#[derive(Debug)]
pub struct SubModel {
    name: String,
    topic: String,
    asset_full_name: String,
    mode: Mode,
    descriptor: SubmodelDescriptor,
    properties: HashMap<String, Arc<Property>>,
    operations: HashMap<String, Arc<Operation>>,
    events: HashMap<String, Arc<Event>>,
    meta: Arc<Property>,
}

impl SubModel {
    pub(crate) fn bind(descriptor: SubmodelDescriptor, ctx: &BindContext) -> Self {
        let def = &descriptor.definition;
        let topic = topic::build([
            ctx.namespace.as_str(),
            ctx.asset_name.as_str(),
            def.name.as_str(),
        ]);
        let properties = def
            .properties
            .iter()
            .flatten()
            .map(|(name, prop_def)| {
                let property = Property::new(name, prop_def.clone(), ctx.mode, ctx.transport.clone(), &topic);
                (name.clone(), Arc::new(property))
            })
            .collect();
        let operations = def
            .operations
            .iter()
            .flatten()
            .map(|(name, op_def)| {
                let operation = Operation::new(
                    name,
                    op_def.clone(),
                    ctx.mode,
                    ctx.transport.clone(),
                    ctx.responses.clone(),
                    ctx.invocation.clone(),
                    &topic,
                );
                (name.clone(), Arc::new(operation))
            })
            .collect();
        let events = def
            .events
            .iter()
            .flatten()
            .map(|(name, event_def)| {
                let event = Event::new(name, event_def.clone(), ctx.mode, ctx.transport.clone(), &topic);
                (name.clone(), Arc::new(event))
            })
            .collect();
        let meta = Arc::new(Property::new(
            META_ELEMENT,
            meta_property_definition(),
            ctx.mode,
            ctx.transport.clone(),
            &topic,
        ));
        SubModel {
            name: def.name.clone(),
            topic,
            asset_full_name: topic::build([ctx.namespace.as_str(), ctx.asset_name.as_str()]),
            mode: ctx.mode,
            descriptor,
            properties,
            operations,
            events,
            meta,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_topic(&self) -> &str {
        &self.topic
    }

    /// `namespace/asset` of the handle this submodel belongs to.
    pub fn asset_full_name(&self) -> &str {
        &self.asset_full_name
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn descriptor(&self) -> &SubmodelDescriptor {
        &self.descriptor
    }

    pub fn url(&self) -> &str {
        &self.descriptor.url
    }

    /// Includes `_meta`.
    pub fn get_property(&self, name: &str) -> Option<Arc<Property>> {
        if name == META_ELEMENT {
            return Some(self.meta.clone());
        }
        self.properties.get(name).cloned()
    }

    pub fn get_operation(&self, name: &str) -> Option<Arc<Operation>> {
        self.operations.get(name).cloned()
    }

    pub fn get_event(&self, name: &str) -> Option<Arc<Event>> {
        self.events.get(name).cloned()
    }

    pub fn property(&self, name: &str) -> Result<Arc<Property>, Error> {
        self.get_property(name).ok_or_else(|| self.not_found("property", name))
    }

    pub fn operation(&self, name: &str) -> Result<Arc<Operation>, Error> {
        self.get_operation(name).ok_or_else(|| self.not_found("operation", name))
    }

    pub fn event(&self, name: &str) -> Result<Arc<Event>, Error> {
        self.get_event(name).ok_or_else(|| self.not_found("event", name))
    }

    fn not_found(&self, kind: &'static str, name: &str) -> Error {
        Error::ElementNotFound {
            kind,
            name: name.to_string(),
            submodel: self.name.clone(),
        }
    }

    /// Declared properties, without `_meta`.
    pub fn properties(&self) -> impl Iterator<Item = &Arc<Property>> {
        self.properties.values()
    }

    pub fn operations(&self) -> impl Iterator<Item = &Arc<Operation>> {
        self.operations.values()
    }

    pub fn events(&self) -> impl Iterator<Item = &Arc<Event>> {
        self.events.values()
    }

    pub fn meta_property(&self) -> Arc<Property> {
        self.meta.clone()
    }

    /// Owner only: publishes the retained `_meta` record.
    pub(crate) async fn publish_meta(&self, source: &str) -> Result<(), Error> {
        let meta = MetaDescriptor {
            source: source.to_string(),
            submodel_url: self.descriptor.url.clone(),
            submodel_definition: self.descriptor.raw.clone(),
        };
        self.meta.set_value(serde_json::to_value(meta)?).await
    }

    /// Topic filters this submodel needs for its handle's mode.
    pub(crate) fn subscriptions(&self) -> BTreeSet<String> {
        match self.mode {
            Mode::Owner => self
                .operations
                .values()
                .map(|op| op.request_topic().to_string())
                .collect(),
            Mode::Consumer => {
                let mut filters: BTreeSet<String> = self
                    .properties
                    .values()
                    .map(|p| p.get_topic().to_string())
                    .chain(self.events.values().map(|e| e.get_topic().to_string()))
                    .chain(self.operations.values().map(|op| op.response_topic().to_string()))
                    .collect();
                filters.insert(self.meta.get_topic().to_string());
                filters
            }
        }
    }

    /// Declared properties plus `_meta`.
    pub(crate) fn owned_properties(&self) -> impl Iterator<Item = &Arc<Property>> {
        self.properties.values().chain(std::iter::once(&self.meta))
    }
}
