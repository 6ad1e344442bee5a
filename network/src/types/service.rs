use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;

/// A protocol handler.
///
/// Query protocols answer each request with at most one response,
/// message protocols never answer.
pub trait Service<Request> {
    type QueryResponse: Send + 'static;
    type OnQueryFuture: Future<Output = Option<Self::QueryResponse>> + Send + 'static;
    type OnMessageFuture: Future<Output = ()> + Send + 'static;

    /// Called when a query is received.
    ///
    /// Returns a future that resolves to the either response to the query if `Some`,
    /// or to the closed stream if `None`.
    fn on_query(&self, req: Request) -> Self::OnQueryFuture;

    /// Called when a one-way message is received.
    fn on_message(&self, req: Request) -> Self::OnMessageFuture;
}

pub trait ServiceExt<Request>: Service<Request> {
    #[inline]
    fn boxed(self) -> BoxService<Request, Self::QueryResponse>
    where
        Self: Sized + Send + Sync + 'static,
    {
        BoxService::new(self)
    }
}

impl<T, Request> ServiceExt<Request> for T where T: Service<Request> + ?Sized {}

impl<S, Request> Service<Request> for Arc<S>
where
    S: Service<Request> + Sync + ?Sized,
{
    type QueryResponse = S::QueryResponse;
    type OnQueryFuture = S::OnQueryFuture;
    type OnMessageFuture = S::OnMessageFuture;

    #[inline]
    fn on_query(&self, req: Request) -> Self::OnQueryFuture {
        <S as Service<Request>>::on_query(self.as_ref(), req)
    }

    #[inline]
    fn on_message(&self, req: Request) -> Self::OnMessageFuture {
        <S as Service<Request>>::on_message(self.as_ref(), req)
    }
}

type DynService<Request, Q> = dyn Service<
        Request,
        QueryResponse = Q,
        OnQueryFuture = BoxFuture<'static, Option<Q>>,
        OnMessageFuture = BoxFuture<'static, ()>,
    > + Send
    + Sync;

#[repr(transparent)]
pub struct BoxService<Request, Q> {
    inner: Box<DynService<Request, Q>>,
}

impl<Request, Q> BoxService<Request, Q>
where
    Q: Send + 'static,
{
    pub fn new<S>(inner: S) -> Self
    where
        S: Service<Request, QueryResponse = Q> + Send + Sync + 'static,
    {
        BoxService {
            inner: Box::new(BoxPinFutures(inner)),
        }
    }
}

impl<Request, Q> Service<Request> for BoxService<Request, Q>
where
    Q: Send + 'static,
{
    type QueryResponse = Q;
    type OnQueryFuture = BoxFuture<'static, Option<Q>>;
    type OnMessageFuture = BoxFuture<'static, ()>;

    #[inline]
    fn on_query(&self, req: Request) -> Self::OnQueryFuture {
        self.inner.on_query(req)
    }

    #[inline]
    fn on_message(&self, req: Request) -> Self::OnMessageFuture {
        self.inner.on_message(req)
    }
}

#[repr(transparent)]
struct BoxPinFutures<S>(S);

impl<S, Request> Service<Request> for BoxPinFutures<S>
where
    S: Service<Request>,
{
    type QueryResponse = S::QueryResponse;
    type OnQueryFuture = BoxFuture<'static, Option<S::QueryResponse>>;
    type OnMessageFuture = BoxFuture<'static, ()>;

    #[inline]
    fn on_query(&self, req: Request) -> Self::OnQueryFuture {
        Box::pin(self.0.on_query(req))
    }

    #[inline]
    fn on_message(&self, req: Request) -> Self::OnMessageFuture {
        Box::pin(self.0.on_message(req))
    }
}
