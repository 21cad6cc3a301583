use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Weak};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use bytes::Bytes;
use futures_util::StreamExt;
use rmw_query_transport::{
    ClientData, Config, Context, EntityKind, GraphEvent, LocalHub, ProstCodec, QosProfile,
    RequestId, ServiceData, TypeInfo, WaitSetData,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, PartialEq, prost::Message)]
struct AddTwoIntsRequest {
    #[prost(int64, tag = "1")]
    a: i64,
    #[prost(int64, tag = "2")]
    b: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
struct AddTwoIntsResponse {
    #[prost(int64, tag = "1")]
    sum: i64,
}

impl prost::Name for AddTwoIntsRequest {
    const NAME: &'static str = "AddTwoInts";
    const PACKAGE: &'static str = "example_interfaces.srv";
}

const SERVICE: &str = "/add_two_ints";

fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Two contexts on one hub: a server side and a caller side.
struct Pair {
    hub: LocalHub,
    server: Context,
    caller: Context,
}

impl Pair {
    fn new(caller_config: Config) -> Result<Self> {
        let hub = LocalHub::new()?;
        let server = Context::with_local_hub(&hub, Config::default())?;
        let caller = Context::with_local_hub(&hub, caller_config)?;
        Ok(Self {
            hub,
            server,
            caller,
        })
    }

    fn service(&self) -> Result<Arc<ServiceData>> {
        let node = self.server.create_node("adder", "/")?;
        Ok(node.create_service(
            SERVICE,
            &TypeInfo::of::<AddTwoIntsRequest>(),
            QosProfile::services_default(),
        )?)
    }

    fn client(&self, qos: QosProfile) -> Result<Arc<ClientData>> {
        let node = self.caller.create_node("caller", "/")?;
        let client = node.create_client(SERVICE, &TypeInfo::of::<AddTwoIntsRequest>(), qos)?;
        anyhow::ensure!(
            eventually(|| self.caller.count_services(SERVICE) == 1),
            "service never discovered"
        );
        Ok(client)
    }
}

/// Take `n` requests off `service`, in arrival order.
fn take_requests(service: &ServiceData, n: usize) -> Result<Vec<RequestId>> {
    let mut taken = Vec::new();
    let deadline = Instant::now() + WAIT;
    while taken.len() < n {
        anyhow::ensure!(Instant::now() < deadline, "only {} of {n} requests arrived", taken.len());
        match service.take_request()? {
            Some((_, info)) => taken.push(RequestId::from(&info)),
            None => thread::sleep(Duration::from_millis(1)),
        }
    }
    Ok(taken)
}

fn counting_callback(client: &ClientData) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    client.set_on_new_response_callback(Some(Arc::new(move |n| {
        c.fetch_add(n, Ordering::SeqCst);
    })));
    count
}

#[test_log::test]
fn call_round_trip_with_prost_codec() -> Result<()> {
    let pair = Pair::new(Config::default())?;
    let service = pair.service()?;
    let client = pair.client(QosProfile::services_default())?;
    assert!(pair
        .caller
        .service_server_is_available(SERVICE, &TypeInfo::of::<AddTwoIntsRequest>().name));

    let request_codec = ProstCodec::<AddTwoIntsRequest>::new();
    let response_codec = ProstCodec::<AddTwoIntsResponse>::new();
    let seq = client.send_request_with(&request_codec, &AddTwoIntsRequest { a: 2, b: 40 })?;
    assert_eq!(seq, 1);

    let server_wait = WaitSetData::new();
    if !service.queue_has_data_and_attach_condition_if_not(&server_wait) {
        assert!(server_wait.wait(Some(WAIT)));
    }
    service.detach_condition_and_queue_is_empty();
    let (request, info) = service
        .take_request_with(&request_codec)?
        .context("no request queued")?;
    assert_eq!(info.sequence_number, seq);
    assert_eq!(info.source_gid, client.gid());
    service.send_response_with(
        &response_codec,
        &RequestId::from(&info),
        &AddTwoIntsResponse {
            sum: request.a + request.b,
        },
    )?;

    let client_wait = WaitSetData::new();
    if !client.queue_has_data_and_attach_condition_if_not(&client_wait) {
        assert!(client_wait.wait(Some(WAIT)));
    }
    client.detach_condition_and_queue_is_empty();
    let (response, info) = client
        .take_response_with(&response_codec)?
        .context("no response queued")?;
    assert_eq!(response.sum, 42);
    assert_eq!(info.sequence_number, seq);
    assert_eq!(info.source_gid, client.gid());
    assert!(info.received_timestamp >= info.source_timestamp);

    assert!(eventually(|| client.in_flight() == 0));
    Ok(())
}

#[test_log::test]
fn replies_queue_in_arrival_order_and_evict_oldest() -> Result<()> {
    let pair = Pair::new(Config::default())?;
    let service = pair.service()?;
    let client = pair.client(QosProfile::services_default().keep_last(2))?;
    let arrived = counting_callback(&client);

    for _ in 0..3 {
        client.send_request(Bytes::new())?;
    }
    let mut requests = take_requests(&service, 3)?;
    requests.sort_by_key(|r| r.sequence_number);

    // Answer 2, 1, 3 and wait for each reply before sending the next.
    for (n, index) in [1usize, 0, 2].into_iter().enumerate() {
        let request = requests[index];
        service.send_response(&request, Bytes::from(request.sequence_number.to_string()))?;
        assert!(eventually(|| arrived.load(Ordering::SeqCst) == n + 1));
    }

    let (first, info) = client.take_response()?.context("queue empty")?;
    assert_eq!((&first[..], info.sequence_number), (&b"1"[..], 1));
    let (second, info) = client.take_response()?.context("queue empty")?;
    assert_eq!((&second[..], info.sequence_number), (&b"3"[..], 3));
    assert!(client.take_response()?.is_none());
    Ok(())
}

#[test_log::test]
fn idle_client_is_released_on_destroy() -> Result<()> {
    let pair = Pair::new(Config::default())?;
    let _service = pair.service()?;
    let client = pair.client(QosProfile::services_default())?;
    let node = pair.caller.node(client.entity().nid()).context("node missing")?;

    let weak: Weak<ClientData> = Arc::downgrade(&client);
    let id = client.id();
    drop(client);

    node.destroy_client(id)?;
    assert!(node.client(id).is_none());
    assert!(weak.upgrade().is_none());
    Ok(())
}

#[test_log::test]
fn client_with_calls_in_flight_outlives_destroy() -> Result<()> {
    let pair = Pair::new(Config::default())?;
    let service = pair.service()?;
    let client = pair.client(QosProfile::services_default())?;
    let node = pair.caller.node(client.entity().nid()).context("node missing")?;

    client.send_request(Bytes::from_static(b"a"))?;
    client.send_request(Bytes::from_static(b"b"))?;
    let requests = take_requests(&service, 2)?;
    assert_eq!(client.in_flight(), 2);

    let weak: Weak<ClientData> = Arc::downgrade(&client);
    let id = client.id();
    drop(client);
    node.destroy_client(id)?;
    node.destroy_client(id)?;

    let client = node.client(id).context("released before calls completed")?;
    assert!(client.is_shutdown());
    assert_eq!(client.in_flight(), 2);
    drop(client);

    service.send_response(&requests[0], Bytes::from_static(b"late"))?;
    assert!(eventually(|| node
        .client(id)
        .map_or(false, |c| c.in_flight() == 1)));
    let client = node.client(id).context("released after the first call")?;
    assert!(client.take_next_reply().is_none());
    drop(client);

    service.send_response(&requests[1], Bytes::from_static(b"late"))?;
    assert!(eventually(|| node.client(id).is_none()));
    assert!(eventually(|| weak.upgrade().is_none()));
    Ok(())
}

#[test_log::test]
fn racing_destroy_and_call_completion_releases_client_once() -> Result<()> {
    const CALLS: usize = 8;
    const RESPONDERS: usize = 4;
    const ROUNDS: usize = 50;

    let pair = Pair::new(Config::default())?;
    let service = pair.service()?;
    let first = pair.client(QosProfile::services_default())?;
    let node = pair.caller.node(first.entity().nid()).context("node missing")?;
    node.destroy_client(first.id())?;
    drop(first);
    let mut released = node.released_client_count();
    assert_eq!(released, 1);

    for round in 0..ROUNDS {
        let client = node.create_client(
            SERVICE,
            &TypeInfo::of::<AddTwoIntsRequest>(),
            QosProfile::services_default(),
        )?;
        let id = client.id();
        for _ in 0..CALLS {
            client.send_request(Bytes::new())?;
        }
        let mut requests = take_requests(&service, CALLS)?;
        let last = requests.pop().context("no requests")?;
        let weak: Weak<ClientData> = Arc::downgrade(&client);
        drop(client);

        // Complete all but one call from several threads while another
        // thread destroys the client.
        let chunks: Vec<Vec<RequestId>> = requests
            .chunks(requests.len().div_ceil(RESPONDERS))
            .map(<[RequestId]>::to_vec)
            .collect();
        let start = Arc::new(Barrier::new(chunks.len() + 1));
        let mut handles = Vec::new();
        for chunk in chunks {
            let service = Arc::clone(&service);
            let start = Arc::clone(&start);
            handles.push(thread::spawn(move || -> rmw_query_transport::Result<()> {
                start.wait();
                for request in &chunk {
                    service.send_response(request, Bytes::new())?;
                }
                Ok(())
            }));
        }
        let destroyer = {
            let node = Arc::clone(&node);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                node.destroy_client(id)
            })
        };
        for handle in handles {
            handle.join().expect("responder panicked")?;
        }
        destroyer.join().expect("destroyer panicked")?;

        assert!(
            eventually(|| weak.upgrade().map_or(false, |c| c.in_flight() == 1)),
            "round {round}: client gone before its last call completed"
        );
        assert_eq!(node.released_client_count(), released, "round {round}");
        assert!(node.client(id).is_some(), "round {round}");

        let destroy_again = {
            let node = Arc::clone(&node);
            thread::spawn(move || node.destroy_client(id))
        };
        service.send_response(&last, Bytes::new())?;
        destroy_again.join().expect("destroyer panicked")?;

        released += 1;
        assert!(eventually(|| weak.upgrade().is_none()), "round {round}");
        assert_eq!(node.released_client_count(), released, "round {round}");
        assert!(node.client(id).is_none());
    }

    thread::sleep(Duration::from_millis(20));
    assert_eq!(node.released_client_count(), ROUNDS + 1);
    Ok(())
}

#[test_log::test]
fn query_timeout_completes_unanswered_calls() -> Result<()> {
    let pair = Pair::new(Config::default().with_query_timeout(Duration::from_millis(50)))?;
    let service = pair.service()?;
    let client = pair.client(QosProfile::services_default())?;

    client.send_request(Bytes::new())?;
    let _held = take_requests(&service, 1)?;
    assert!(eventually(|| client.in_flight() == 0));
    assert!(client.take_response()?.is_none());
    Ok(())
}

#[test_log::test]
fn concurrent_calls_get_distinct_sequence_numbers() -> Result<()> {
    let hub = LocalHub::new()?;
    let ctx = Context::with_local_hub(&hub, Config::default())?;
    let node = ctx.create_node("caller", "/")?;
    let client = node.create_client(
        SERVICE,
        &TypeInfo::of::<AddTwoIntsRequest>(),
        QosProfile::services_default(),
    )?;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let client = Arc::clone(&client);
            thread::spawn(move || -> rmw_query_transport::Result<Vec<i64>> {
                (0..50).map(|_| client.send_request(Bytes::new())).collect()
            })
        })
        .collect();

    let mut seqs = Vec::new();
    for handle in handles {
        let local = handle.join().expect("sender panicked")?;
        assert!(local.windows(2).all(|w| w[0] < w[1]));
        seqs.extend(local);
    }
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=200).collect::<Vec<i64>>());
    assert!(eventually(|| client.in_flight() == 0));
    Ok(())
}

#[test_log::test]
fn bootstrap_sees_existing_graph_and_stream_sees_changes() -> Result<()> {
    let hub = LocalHub::new()?;
    let remote = Context::with_local_hub(&hub, Config::default())?;
    let talker = remote.create_node("talker", "/demo")?;
    talker.create_publisher("/chatter", &TypeInfo::new("String", "string"), QosProfile::default())?;

    let ctx = Context::with_local_hub(&hub, Config::default())?;
    // Construction returns only after the snapshot was applied.
    assert_eq!(ctx.count_publishers("/chatter"), 1);
    assert_eq!(ctx.node_names().len(), 1);
    assert!(ctx
        .topic_names_and_types()
        .get("/chatter")
        .map_or(false, |types| types.contains("String")));

    let mut events = ctx.graph_events();
    let listener = remote.create_node("listener", "/demo")?;
    let sub = listener.create_subscription(
        "/chatter",
        &TypeInfo::new("String", "string"),
        QosProfile::default(),
    )?;

    let (first, second) = tokio_test::block_on(async {
        let first = tokio::time::timeout(WAIT, events.next()).await?;
        let second = tokio::time::timeout(WAIT, events.next()).await?;
        Ok::<_, tokio::time::error::Elapsed>((first, second))
    })?;
    assert!(matches!(first, Some(GraphEvent::Put(ref e)) if e.kind() == EntityKind::Node));
    assert!(matches!(second, Some(GraphEvent::Put(ref e)) if e.keyexpr() == sub.keyexpr()));

    assert_eq!(ctx.count_subscriptions("/chatter"), 1);
    let infos = ctx.endpoints_info_by_topic(EntityKind::Subscription, "/chatter");
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].node_name, "listener");
    assert_eq!(infos[0].gid, sub.gid());

    remote.destroy_node(listener.id())?;
    let deleted = tokio_test::block_on(async { tokio::time::timeout(WAIT, events.next()).await })?;
    assert!(matches!(deleted, Some(GraphEvent::Delete(_))));
    assert!(eventually(|| ctx.count_subscriptions("/chatter") == 0));
    Ok(())
}

#[test_log::test]
fn graph_guard_fires_on_remote_changes() -> Result<()> {
    let hub = LocalHub::new()?;
    let ctx = Context::with_local_hub(&hub, Config::default())?;
    let guard = Arc::clone(ctx.graph_guard_condition());
    let wait_set = WaitSetData::new();
    guard.get_and_reset_trigger();
    guard.attach_condition(Arc::clone(&wait_set));

    let remote = Context::with_local_hub(&hub, Config::default())?;
    remote.create_node("late", "/")?;
    assert!(wait_set.wait(Some(WAIT)));
    assert!(guard.get_and_reset_trigger());
    guard.detach_condition();
    Ok(())
}

#[test_log::test]
fn duplicate_announcements_are_absorbed() -> Result<()> {
    let hub = LocalHub::new()?;
    let remote = Context::with_local_hub(&hub, Config::default())?;
    let node = remote.create_node("talker", "/")?;
    let publisher =
        node.create_publisher("/chatter", &TypeInfo::new("String", "s"), QosProfile::default())?;

    let ctx = Context::with_local_hub(&hub, Config::default())?;
    let cache = ctx.graph_cache();
    let nodes = cache.node_count();
    let endpoints = cache.endpoint_count();

    // The same token seen again, as when bootstrap and the live feed overlap.
    let entity = cache
        .parse_put(publisher.keyexpr(), false)?
        .context("token should parse")?;
    assert!(!cache.apply_put(&entity));
    assert_eq!(cache.node_count(), nodes);
    assert_eq!(cache.endpoint_count(), endpoints);
    assert_eq!(ctx.count_publishers("/chatter"), 1);
    Ok(())
}

#[test_log::test]
fn shutdown_withdraws_every_token() -> Result<()> {
    let pair = Pair::new(Config::default())?;
    let _service = pair.service()?;
    let _client = pair.client(QosProfile::services_default())?;
    assert!(!pair.hub.live_tokens().is_empty());

    pair.server.shutdown()?;
    pair.caller.shutdown()?;
    assert!(pair.hub.live_tokens().is_empty());
    Ok(())
}

#[test_log::test]
fn context_refuses_current_thread_runtime() -> Result<()> {
    let hub = LocalHub::new()?;
    let refused = tokio_test::block_on(async { Context::with_local_hub(&hub, Config::default()) });
    assert!(matches!(
        refused,
        Err(rmw_query_transport::Error::BlockingInRuntime(_))
    ));

    let remote = Context::with_local_hub(&hub, Config::default())?;
    remote.create_node("talker", "/")?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .build()?;
    let ctx = runtime.block_on(async { Context::with_local_hub(&hub, Config::default()) })?;
    assert_eq!(ctx.node_names().len(), 1);
    Ok(())
}
