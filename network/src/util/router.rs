use std::marker::PhantomData;
use std::sync::Arc;

use cairn_util::FastHashMap;
use futures_util::future::BoxFuture;

use crate::types::{BoxService, Service, ServiceExt, ServiceRequest};

/// Protocols handled by a service.
pub trait Routable {
    #[inline]
    fn query_protocols(&self) -> impl IntoIterator<Item = &'static str> {
        std::iter::empty()
    }

    #[inline]
    fn message_protocols(&self) -> impl IntoIterator<Item = &'static str> {
        std::iter::empty()
    }
}

/// How an accepted stream must be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// The remote waits for a single response.
    Query,
    /// The remote expects nothing back.
    Message,
}

pub struct RouterBuilder<Q> {
    inner: Inner<Q>,
}

impl<Q> RouterBuilder<Q> {
    pub fn route<S>(mut self, service: S) -> Self
    where
        S: Service<ServiceRequest, QueryResponse = Q> + Routable + Send + Sync + 'static,
        Q: Send + 'static,
    {
        let index = self.inner.services.len();
        for protocol in service.query_protocols() {
            let prev = (self.inner.routes).insert(protocol, (index, RouteKind::Query));
            assert!(prev.is_none(), "duplicate protocol: {protocol}");
        }
        for protocol in service.message_protocols() {
            let prev = (self.inner.routes).insert(protocol, (index, RouteKind::Message));
            assert!(prev.is_none(), "duplicate protocol: {protocol}");
        }

        self.inner.services.push(service.boxed());
        self
    }

    pub fn build(self) -> Router<Q> {
        Router {
            inner: Arc::new(self.inner),
        }
    }
}

impl<Q> Default for RouterBuilder<Q> {
    fn default() -> Self {
        Self {
            inner: Inner {
                services: Vec::new(),
                routes: FastHashMap::default(),
                _response: PhantomData,
            },
        }
    }
}

/// Dispatches inbound streams to services by their negotiated protocol.
pub struct Router<Q> {
    inner: Arc<Inner<Q>>,
}

impl<Q> Router<Q> {
    pub fn builder() -> RouterBuilder<Q> {
        RouterBuilder::default()
    }

    /// Returns the canonical protocol name and the kind of its route.
    pub fn resolve(&self, protocol: &str) -> Option<(&'static str, RouteKind)> {
        let (name, (_, kind)) = self.inner.routes.get_key_value(protocol)?;
        Some((*name, *kind))
    }

    pub fn protocols(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.inner.routes.keys().copied()
    }

    fn find_handler(&self, protocol: &str, kind: RouteKind) -> Option<&BoxService<ServiceRequest, Q>> {
        match self.inner.routes.get(protocol) {
            // NOTE: intentionally panics if index is out of bounds as it is
            // an implementation error.
            Some((index, route_kind)) if *route_kind == kind => {
                Some(self.inner.services.get(*index).expect("index must be in bounds"))
            }
            _ => None,
        }
    }
}

impl<Q> Clone for Router<Q> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Q> Service<ServiceRequest> for Router<Q>
where
    Q: Send + 'static,
{
    type QueryResponse = Q;
    type OnQueryFuture = BoxFuture<'static, Option<Q>>;
    type OnMessageFuture = BoxFuture<'static, ()>;

    fn on_query(&self, req: ServiceRequest) -> Self::OnQueryFuture {
        match self.find_handler(req.protocol, RouteKind::Query) {
            Some(service) => service.on_query(req),
            None => Box::pin(futures_util::future::ready(None)),
        }
    }

    fn on_message(&self, req: ServiceRequest) -> Self::OnMessageFuture {
        match self.find_handler(req.protocol, RouteKind::Message) {
            Some(service) => service.on_message(req),
            None => Box::pin(futures_util::future::ready(())),
        }
    }
}

struct Inner<Q> {
    services: Vec<BoxService<ServiceRequest, Q>>,
    routes: FastHashMap<&'static str, (usize, RouteKind)>,
    _response: PhantomData<Q>,
}
