//! Container runtime interface.
//!
//! The reconciler consumes the runtime through the [`Runtime`] trait;
//! [`DockerRuntime`] adapts the Docker Engine API via bollard. Tests swap
//! in an in-memory runtime.

use async_trait::async_trait;
use bollard::models::{EventMessage, EventMessageTypeEnum};
use bollard::query_parameters::{EventsOptions, InspectContainerOptions, ListContainersOptions};
use bollard::Docker;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use std::net::Ipv4Addr;
use tracing::debug;

use crate::error::Error;

/// Connection timeout for the Docker API, in seconds.
const API_TIMEOUT: u64 = 120;

/// Capacity of the event channel while the reconciler is enumerating.
const EVENT_BUFFER: usize = 64;

/// Container lifecycle actions the reconciler reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    /// Container started; register it.
    Start,
    /// Container died; unregister it.
    Die,
    /// Anything else; ignored.
    Other,
}

/// A lifecycle event from the runtime's stream.
#[derive(Debug, Clone)]
pub struct ContainerEvent {
    /// What happened.
    pub action: EventAction,
    /// Container id the event refers to.
    pub id: String,
}

/// The slice of container state the reconciler needs.
#[derive(Debug, Clone, Default)]
pub struct ContainerDetails {
    /// Opaque container id.
    pub id: String,
    /// Container name as reported by the runtime (leading slash included).
    pub name: String,
    /// Configured hostname.
    pub hostname: String,
    /// Configured domain name; often empty.
    pub domainname: String,
    /// Raw `KEY=value` environment entries.
    pub env: Vec<String>,
    /// Bridge-network IPv4, when attached to a bridge.
    pub ip_address: Option<Ipv4Addr>,
    /// Network mode: `default`, `host`, `container:<ref>`, ...
    pub network_mode: String,
    /// Name of the bridge the container is attached to.
    pub bridge: Option<String>,
    /// Gateway of that bridge.
    pub gateway: Option<Ipv4Addr>,
}

/// What the reconciler needs from a container runtime.
#[async_trait]
pub trait Runtime: Send + Sync + 'static {
    /// Ids of all currently-known containers.
    async fn list_containers(&self) -> Result<Vec<String>, Error>;

    /// Inspect one container by id or name.
    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, Error>;

    /// Subscribe to the lifecycle event stream. Events arriving after this
    /// call are buffered, so subscribing before enumeration loses none.
    fn events(&self) -> BoxStream<'static, Result<ContainerEvent, Error>>;
}

/// [`Runtime`] backed by the Docker Engine API.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the endpoint (`unix://...`, `tcp://...` or `http://...`).
    pub fn connect(endpoint: &str) -> Result<Self, Error> {
        let docker = if endpoint.starts_with("unix://") {
            Docker::connect_with_unix(endpoint, API_TIMEOUT, bollard::API_DEFAULT_VERSION)?
        } else if endpoint.starts_with("tcp://") || endpoint.starts_with("http://") {
            Docker::connect_with_http(endpoint, API_TIMEOUT, bollard::API_DEFAULT_VERSION)?
        } else {
            return Err(Error::Config(format!(
                "unsupported docker endpoint \"{endpoint}\""
            )));
        };
        Ok(Self { docker })
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn list_containers(&self) -> Result<Vec<String>, Error> {
        let containers = self
            .docker
            .list_containers(Option::<ListContainersOptions>::None)
            .await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, Error> {
        let response = self
            .docker
            .inspect_container(id, Option::<InspectContainerOptions>::None)
            .await?;

        let config = response.config.unwrap_or_default();
        let network = response.network_settings.unwrap_or_default();
        let host_config = response.host_config.unwrap_or_default();

        #[allow(deprecated)]
        Ok(ContainerDetails {
            id: response.id.unwrap_or_else(|| id.to_string()),
            name: response.name.unwrap_or_default(),
            hostname: config.hostname.unwrap_or_default(),
            domainname: config.domainname.unwrap_or_default(),
            env: config.env.unwrap_or_default(),
            ip_address: parse_ip(network.ip_address.as_deref()),
            network_mode: host_config.network_mode.unwrap_or_default(),
            bridge: network.bridge.filter(|b| !b.is_empty()),
            gateway: parse_ip(network.gateway.as_deref()),
        })
    }

    fn events(&self) -> BoxStream<'static, Result<ContainerEvent, Error>> {
        let docker = self.docker.clone();
        let (mut tx, rx) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(async move {
            let mut stream = docker.events(Option::<EventsOptions>::None);
            while let Some(item) = stream.next().await {
                let mapped = item.map(map_event).map_err(Error::from);
                if tx.send(mapped).await.is_err() {
                    debug!("event subscriber went away, stopping pump");
                    return;
                }
            }
            debug!("docker event stream ended");
        });

        rx.boxed()
    }
}

fn parse_ip(value: Option<&str>) -> Option<Ipv4Addr> {
    value.filter(|v| !v.is_empty()).and_then(|v| v.parse().ok())
}

fn map_event(message: EventMessage) -> ContainerEvent {
    let id = message
        .actor
        .and_then(|actor| actor.id)
        .unwrap_or_default();
    let action = if message.typ == Some(EventMessageTypeEnum::CONTAINER) {
        match message.action.as_deref() {
            Some("start") => EventAction::Start,
            Some("die") => EventAction::Die,
            _ => EventAction::Other,
        }
    } else {
        EventAction::Other
    };
    ContainerEvent { action, id }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::EventActor;

    fn event(typ: Option<EventMessageTypeEnum>, action: &str, id: &str) -> EventMessage {
        EventMessage {
            typ,
            action: Some(action.to_string()),
            actor: Some(EventActor {
                id: Some(id.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn container_start_and_die_are_mapped() {
        let start = map_event(event(Some(EventMessageTypeEnum::CONTAINER), "start", "c1"));
        assert_eq!(start.action, EventAction::Start);
        assert_eq!(start.id, "c1");

        let die = map_event(event(Some(EventMessageTypeEnum::CONTAINER), "die", "c1"));
        assert_eq!(die.action, EventAction::Die);
    }

    #[test]
    fn non_container_events_are_other() {
        let image = map_event(event(Some(EventMessageTypeEnum::IMAGE), "pull", "img"));
        assert_eq!(image.action, EventAction::Other);

        let pause = map_event(event(Some(EventMessageTypeEnum::CONTAINER), "pause", "c1"));
        assert_eq!(pause.action, EventAction::Other);
    }

    #[test]
    fn parse_ip_rejects_empty_and_garbage() {
        assert_eq!(parse_ip(Some("172.17.0.2")), Some("172.17.0.2".parse().unwrap()));
        assert_eq!(parse_ip(Some("")), None);
        assert_eq!(parse_ip(Some("not-an-ip")), None);
        assert_eq!(parse_ip(None), None);
    }
}
