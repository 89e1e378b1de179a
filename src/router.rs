//! Radix-tree request router.
//!
//! A [`Router`] is itself a [`Handler`]: it walks the tree built by
//! [`insert`](Router::insert) to find a method-scoped handler chain for the
//! incoming path, then runs that chain the same way [`HttpConnection`]
//! (crate::server::connection::HttpConnection) runs a single handler -
//! sequentially, stopping as soon as a link finalizes the response.
//!
//! Sibling priority at every level is Static > Param > Wildcard, and a
//! Wildcard match always terminates the walk (it captures the remainder of
//! the path, slashes included). Route registration is expected to happen
//! once at startup; `find` takes no locks and is safe to call from every
//! connection's task concurrently.

use crate::{pool::Pool, ConnectionData, Handled, Handler, Method, Request, Response, StatusCode};
use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

/// Resolved `:name`/`*name` captures for a single matched request.
///
/// Keys are the `'static` parameter names taken from the route pattern;
/// values borrow directly from the request's own zero-copy path storage.
#[derive(Debug, Default, Clone)]
pub struct Params {
    entries: Vec<(&'static str, &'static [u8])>,
}

impl Params {
    /// Looks up a captured segment by parameter name.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| *value)
    }

    #[inline]
    fn push(&mut self, name: &'static str, value: &'static [u8]) {
        self.entries.push((name, value));
    }

    #[inline]
    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A single link in a route's handler chain.
///
/// Shaped like [`Handler`] but with an extra [`Params`] argument carrying the
/// route's captured segments. A chain entry that wants to stop the remaining
/// links from running should finalize the response itself (`resp.body(..)`
/// or `resp.close().body(..)`); the router checks after every link and does
/// not run the rest once that happens.
pub trait RouteHandler<S = ()>: Send + Sync + 'static
where
    S: ConnectionData,
{
    fn handle(
        &self,
        connection_data: &mut S,
        request: &Request,
        params: &Params,
        response: &mut Response,
    ) -> impl Future<Output = Handled> + Send;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

trait ErasedRouteHandler<S: ConnectionData>: Send + Sync {
    fn call<'a>(
        &'a self,
        connection_data: &'a mut S,
        request: &'a Request,
        params: &'a Params,
        response: &'a mut Response,
    ) -> BoxFuture<'a, Handled>;
}

impl<S: ConnectionData, H: RouteHandler<S>> ErasedRouteHandler<S> for H {
    fn call<'a>(
        &'a self,
        connection_data: &'a mut S,
        request: &'a Request,
        params: &'a Params,
        response: &'a mut Response,
    ) -> BoxFuture<'a, Handled> {
        Box::pin(self.handle(connection_data, request, params, response))
    }
}

type Chain<S> = Arc<[Arc<dyn ErasedRouteHandler<S>>]>;

struct Node<S: ConnectionData> {
    static_children: HashMap<Vec<u8>, Node<S>>,
    param_child: Option<(&'static str, Box<Node<S>>)>,
    wildcard_child: Option<(&'static str, Box<Node<S>>)>,
    handlers: HashMap<Method, Chain<S>>,
}

impl<S: ConnectionData> Node<S> {
    fn empty() -> Self {
        Node {
            static_children: HashMap::new(),
            param_child: None,
            wildcard_child: None,
            handlers: HashMap::new(),
        }
    }
}

enum Segment<'a> {
    Static(&'a [u8]),
    Param(&'static str),
    Wildcard(&'static str),
}

fn split_pattern(pattern: &'static str) -> Vec<Segment<'static>> {
    pattern
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|seg| {
            if let Some(name) = seg.strip_prefix(':') {
                Segment::Param(name)
            } else if seg == "*" {
                Segment::Wildcard("")
            } else if let Some(name) = seg.strip_prefix('*') {
                Segment::Wildcard(name)
            } else {
                Segment::Static(seg.as_bytes())
            }
        })
        .collect()
}

fn split_path(path: &[u8]) -> impl Iterator<Item = &[u8]> {
    path.split(|&b| b == b'/').filter(|s| !s.is_empty())
}

/// Radix-tree dispatcher; hand it to [`ServerBuilder::handler`](crate::ServerBuilder::handler)
/// once routes are registered.
pub struct Router<S: ConnectionData = ()> {
    root: Node<S>,
    not_found: Option<Chain<S>>,
    // Per the router's allocation policy: the path-segment list `find` builds
    // for each lookup is drawn from a pool instead of allocating fresh.
    segment_pool: Pool<Vec<&'static [u8]>>,
}

impl<S: ConnectionData> Router<S> {
    pub fn new() -> Self {
        Router {
            root: Node::empty(),
            not_found: None,
            segment_pool: Pool::new(),
        }
    }

    /// Registers a single handler for `method` at `pattern`. Re-inserting the
    /// same `(pattern, method)` overwrites the previous chain.
    pub fn insert(&mut self, method: Method, pattern: &'static str, handler: impl RouteHandler<S>) {
        self.insert_chain(method, pattern, vec![Arc::new(handler) as Arc<dyn ErasedRouteHandler<S>>]);
    }

    /// Registers an ordered middleware chain for `method` at `pattern`. Links
    /// run in order; the first one to finalize the response stops the rest.
    pub fn insert_chain(
        &mut self,
        method: Method,
        pattern: &'static str,
        chain: Vec<Arc<dyn ErasedRouteHandler<S>>>,
    ) {
        if pattern.is_empty() {
            return;
        }
        let segments = split_pattern(pattern);

        let mut node = &mut self.root;
        for segment in segments {
            node = match segment {
                Segment::Static(literal) => node
                    .static_children
                    .entry(literal.to_vec())
                    .or_insert_with(Node::empty),
                Segment::Param(name) => {
                    &mut node
                        .param_child
                        .get_or_insert_with(|| (name, Box::new(Node::empty())))
                        .1
                }
                Segment::Wildcard(name) => {
                    &mut node
                        .wildcard_child
                        .get_or_insert_with(|| (name, Box::new(Node::empty())))
                        .1
                }
            };
        }

        node.handlers.insert(method, Chain::from(chain));
    }

    /// Handler chain run when no route matches the path at all (as opposed
    /// to matching the path but not the method). Defaults to a plain-text 404.
    pub fn not_found(&mut self, handler: impl RouteHandler<S>) {
        self.not_found = Some(Chain::from(vec![Arc::new(handler) as Arc<dyn ErasedRouteHandler<S>>]));
    }

    /// Looks up a method-scoped handler chain for `path`, filling `params`
    /// with any `:name`/`*name` captures. Leaves `params` untouched on a miss.
    pub fn find(&self, method: Method, path: &[u8], params: &mut Params) -> Option<Chain<S>> {
        let mut segments = self.segment_pool.acquire();
        segments.extend(split_path(path).map(|s| unsafe { to_static(s) }));
        Self::walk(&self.root, path, &segments, params).and_then(|node| node.handlers.get(&method).cloned())
    }

    /// Like [`find`](Router::find), but only ever descends Static children -
    /// no `Params` allocation, no Param/Wildcard walk.
    pub fn find_static(&self, method: Method, path: &[u8]) -> Option<Chain<S>> {
        let mut node = &self.root;
        for segment in split_path(path) {
            node = node.static_children.get(segment)?;
        }
        node.handlers.get(&method).cloned()
    }

    fn walk<'n>(node: &'n Node<S>, full_path: &[u8], segments: &[&[u8]], params: &mut Params) -> Option<&'n Node<S>> {
        let Some((head, tail)) = segments.split_first() else {
            return Some(node);
        };

        if let Some(child) = node.static_children.get(*head) {
            if let Some(found) = Self::walk(child, full_path, tail, params) {
                return Some(found);
            }
        }

        if let Some((name, child)) = &node.param_child {
            let mark = params.entries.len();
            params.push(name, unsafe { to_static(head) });
            if let Some(found) = Self::walk(child, full_path, tail, params) {
                return Some(found);
            }
            params.entries.truncate(mark);
        }

        if let Some((name, child)) = &node.wildcard_child {
            // `head` is a sub-slice of `full_path` (both come from the same
            // `split_path` call), so the remainder of the path - slashes
            // included - is a single contiguous slice starting at `head`.
            let offset = head.as_ptr() as usize - full_path.as_ptr() as usize;
            let captured = &full_path[offset..];
            params.push(name, unsafe { to_static(captured) });
            return Some(child);
        }

        None
    }
}

// SAFETY: path segments handed to `find`/`walk` are always produced from
// `Url::path_segments`, which is itself a view over the connection's
// fixed, per-connection request buffer kept alive for the duration of the
// request - the same convention `Parser::into_static` relies on elsewhere
// in this crate.
#[inline(always)]
unsafe fn to_static(slice: &[u8]) -> &'static [u8] {
    std::mem::transmute(slice)
}

impl<S: ConnectionData> Default for Router<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ConnectionData> Handler<S> for Router<S> {
    async fn handle(&self, connection_data: &mut S, request: &Request, response: &mut Response) -> Handled {
        let mut params = Params::default();
        let chain = self.find(request.method(), request.url().path(), &mut params);

        let Some(chain) = chain else {
            if let Some(not_found) = &self.not_found {
                return Self::run_chain(not_found, connection_data, request, &params, response).await;
            }
            return response.status(StatusCode::NotFound).body("Not Found");
        };

        Self::run_chain(&chain, connection_data, request, &params, response).await
    }
}

impl<S: ConnectionData> Router<S> {
    async fn run_chain(
        chain: &[Arc<dyn ErasedRouteHandler<S>>],
        connection_data: &mut S,
        request: &Request,
        params: &Params,
        response: &mut Response,
    ) -> Handled {
        for link in chain {
            let handled = link.call(connection_data, request, params, response).await;
            if response.is_complete() {
                return handled;
            }
        }

        response.status(StatusCode::InternalServerError).body("")
    }
}
