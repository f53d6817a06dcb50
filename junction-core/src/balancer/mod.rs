//! Load balancing across a route's endpoint set.
//!
//! Round-robin, random and consistent-hash selection wrap
//! `pingora_load_balancing`'s own `LoadBalancer<_>` types, the same way the
//! proxy's `UpstreamFactory`/`Balancer` pick a `BalancerType` per upstream.
//! Power-of-two-choices and least-requests have no equivalent in that
//! crate's `selection` module, so they are hand-rolled against an
//! [`endpoint::Endpoint`] registry that tracks in-flight counts.

pub mod endpoint;

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use pingora_load_balancing::{discovery, prelude::RoundRobin, selection::consistent::KetamaHashing, selection::Random, Backend, Backends, LoadBalancer};

use endpoint::Endpoint;

/// The selection strategy a `LoadBalanced` backend dispatches through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Algorithm {
    RoundRobin,
    Random,
    ConsistentHash,
    PowerOfTwoChoices,
    LeastRequests,
}

/// Wraps whichever concrete `LoadBalancer<_>` a `pingora_load_balancing`
/// algorithm needs, the same way `Balancer` dispatches on a `BalancerType`.
enum PingoraBalancer {
    RoundRobin(LoadBalancer<RoundRobin>),
    Random(LoadBalancer<Random>),
    ConsistentHash(LoadBalancer<KetamaHashing>),
}

/// A compiled, ready-to-select load balancer for one route's endpoint set.
pub struct EndpointBalancer {
    algorithm: Algorithm,
    pingora: Option<PingoraBalancer>,
    endpoints: Vec<Arc<Endpoint>>,
}

impl EndpointBalancer {
    /// Builds the balancer for `addrs` under `algorithm`. `pingora`-backed
    /// algorithms build their `LoadBalancer` eagerly from a static
    /// discovery set, matching `UpstreamFactory::create_context`'s use of
    /// `discovery::Static`.
    pub fn new(addrs: Vec<String>, algorithm: Algorithm) -> Self {
        let endpoints = addrs.iter().map(|a| Arc::new(Endpoint::new(a.clone()))).collect();

        let pingora = match algorithm {
            Algorithm::RoundRobin | Algorithm::Random | Algorithm::ConsistentHash => {
                let backends: BTreeSet<Backend> = addrs.iter().filter_map(|a| Backend::new(a).ok()).collect();
                let disco = discovery::Static::new(backends);
                Some(match algorithm {
                    Algorithm::RoundRobin => {
                        PingoraBalancer::RoundRobin(LoadBalancer::<RoundRobin>::from_backends(Backends::new(disco)))
                    }
                    Algorithm::Random => {
                        PingoraBalancer::Random(LoadBalancer::<Random>::from_backends(Backends::new(disco)))
                    }
                    Algorithm::ConsistentHash => PingoraBalancer::ConsistentHash(LoadBalancer::<KetamaHashing>::from_backends(
                        Backends::new(disco),
                    )),
                    _ => unreachable!(),
                })
            }
            Algorithm::PowerOfTwoChoices | Algorithm::LeastRequests => None,
        };

        Self { algorithm, pingora, endpoints }
    }

    /// Forces an immediate, synchronous refresh of the static discovery set
    /// for `pingora`-backed algorithms. Static discovery never blocks, so
    /// this mirrors `upstream_factory.rs`'s `update().now_or_never()` dance
    /// at construction time.
    pub async fn prime(&self) {
        match &self.pingora {
            Some(PingoraBalancer::RoundRobin(b)) => {
                let _ = b.update().await;
            }
            Some(PingoraBalancer::Random(b)) => {
                let _ = b.update().await;
            }
            Some(PingoraBalancer::ConsistentHash(b)) => {
                let _ = b.update().await;
            }
            None => {}
        }
    }

    /// Picks one endpoint. `hash_key` is only consulted by
    /// `ConsistentHash`; other algorithms ignore it.
    pub fn select(&self, hash_key: &[u8]) -> Option<Arc<Endpoint>> {
        match (&self.algorithm, &self.pingora) {
            (Algorithm::RoundRobin, Some(PingoraBalancer::RoundRobin(b))) => {
                self.resolve_pingora_pick(b.select(hash_key, 256))
            }
            (Algorithm::Random, Some(PingoraBalancer::Random(b))) => self.resolve_pingora_pick(b.select(hash_key, 256)),
            (Algorithm::ConsistentHash, Some(PingoraBalancer::ConsistentHash(b))) => {
                self.resolve_pingora_pick(b.select(hash_key, 256))
            }
            (Algorithm::PowerOfTwoChoices, _) => self.select_power_of_two(),
            (Algorithm::LeastRequests, _) => self.select_least_requests(),
            _ => None,
        }
    }

    fn resolve_pingora_pick(&self, backend: Option<Backend>) -> Option<Arc<Endpoint>> {
        let backend = backend?;
        let addr = backend.addr.to_string();
        self.endpoints.iter().find(|e| e.address == addr).cloned()
    }

    /// Samples two distinct endpoints at random (address-hash-seeded, not
    /// `rand`, to avoid pulling in a new dependency for what the registry
    /// can already do with a cheap hash) and returns whichever has fewer
    /// in-flight requests, skipping endpoints marked `Failing`.
    fn select_power_of_two(&self) -> Option<Arc<Endpoint>> {
        let healthy: Vec<&Arc<Endpoint>> =
            self.endpoints.iter().filter(|e| e.health() != endpoint::Health::Failing).collect();
        if healthy.is_empty() {
            return self.endpoints.iter().min_by_key(|e| e.in_flight()).cloned();
        }
        if healthy.len() == 1 {
            return Some(healthy[0].clone());
        }

        let len = healthy.len();
        let seed = pseudo_random_index(len);
        let a_idx = seed % len;
        let offset = 1 + (seed / len) % (len - 1);
        let b_idx = (a_idx + offset) % len;
        let a = healthy[a_idx];
        let b = healthy[b_idx];
        if a.in_flight() <= b.in_flight() {
            Some(a.clone())
        } else {
            Some(b.clone())
        }
    }

    fn select_least_requests(&self) -> Option<Arc<Endpoint>> {
        self.endpoints
            .iter()
            .filter(|e| e.health() != endpoint::Health::Failing)
            .min_by_key(|e| e.in_flight())
            .or_else(|| self.endpoints.iter().min_by_key(|e| e.in_flight()))
            .cloned()
    }
}

/// Keeps one [`EndpointBalancer`] alive per route for as long as its
/// endpoint set and algorithm stay unchanged, so in-flight counts and
/// consecutive-failure health survive across requests and across snapshot
/// republications — the same lifetime contract `BreakerRegistry` gives
/// circuit breakers. The proxy transport asks for a route's balancer on
/// every request; a route whose backend definition changed gets a fresh
/// balancer (and loses its accumulated health state, same as a breaker
/// created fresh under a changed key).
pub struct BalancerRegistry {
    entries: AsyncMutex<HashMap<String, (Vec<String>, Algorithm, Arc<EndpointBalancer>)>>,
}

impl Default for BalancerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BalancerRegistry {
    pub fn new() -> Self {
        Self { entries: AsyncMutex::new(HashMap::new()) }
    }

    /// Returns the live balancer for `route_id`, creating (or replacing) it
    /// if this is the first request since startup or since `endpoints`/
    /// `algorithm` last changed for that route.
    pub async fn get_or_create(&self, route_id: &str, endpoints: &[String], algorithm: &Algorithm) -> Arc<EndpointBalancer> {
        let mut entries = self.entries.lock().await;
        if let Some((existing_endpoints, existing_algorithm, balancer)) = entries.get(route_id) {
            if existing_endpoints.as_slice() == endpoints && existing_algorithm == algorithm {
                return balancer.clone();
            }
        }

        let balancer = Arc::new(EndpointBalancer::new(endpoints.to_vec(), algorithm.clone()));
        balancer.prime().await;
        entries.insert(route_id.to_string(), (endpoints.to_vec(), algorithm.clone(), balancer.clone()));
        balancer
    }
}

/// A process-lifetime counter standing in for a dice roll: good enough to
/// spread power-of-two sampling across endpoints without adding a `rand`
/// dependency the rest of the stack does not otherwise need.
fn pseudo_random_index(modulus: usize) -> usize {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    if modulus == 0 {
        0
    } else {
        n % modulus
    }
}
