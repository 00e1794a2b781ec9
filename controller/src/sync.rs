//! MQTT side of the property sync: announces the device tree, feeds remote commands into the
//! setters and mirrors state changes back out as retained values.

use std::{fmt::Display, sync::Arc, time::Duration};

use rumqttc::{
    AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing, QoS,
    SubscribeReasonCode,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use sunrise_common::{
    config::MqttConfig, homie, DeviceState, Error, PropertyId, PropertySnapshot, Result,
    RetainedSync, Route, Topics,
};

use crate::host::{wait_for_shutdown, AppState};

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

struct Session {
    client: AsyncClient,
    topics: Topics,
    device_name: String,
    settle: Duration,
    retained: Mutex<RetainedSync>,
    /// Values last announced on this connection. `None` until `$state` is `ready`.
    published: Mutex<Option<PropertySnapshot>>,
}

impl Session {
    fn new(client: AsyncClient, topics: Topics, device_name: String, settle: Duration) -> Self {
        Self {
            client,
            topics,
            device_name,
            settle,
            retained: Mutex::new(RetainedSync::new()),
            published: Mutex::new(None),
        }
    }
}

pub fn spawn(state: AppState, config: &MqttConfig) -> JoinHandle<()> {
    let topics = Topics::new(&config.base_topic, &config.device_id);

    let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(15));
    options.set_last_will(LastWill::new(
        topics.state(),
        DeviceState::Lost.as_str(),
        QoS::AtLeastOnce,
        true,
    ));
    if !config.user.is_empty() {
        options.set_credentials(config.user.clone(), config.pass.clone());
    }

    let (client, eventloop) = AsyncClient::new(options, 64);
    info!(
        host = %config.host,
        port = config.port,
        root = topics.root(),
        "mqtt sync starting"
    );

    let session = Arc::new(Session::new(
        client,
        topics,
        config.device_id.clone(),
        Duration::from_millis(config.retained_settle_ms),
    ));
    tokio::spawn(run(state, session, eventloop))
}

async fn run(state: AppState, session: Arc<Session>, mut eventloop: EventLoop) {
    let shutdown = wait_for_shutdown(state.shutdown_signal());
    tokio::pin!(shutdown);

    let mirror = tokio::spawn(mirror_properties(state.clone(), session.clone()));
    let mut announcing: Option<JoinHandle<()>> = None;

    // Never awaits a session lock: the announce and mirror tasks may hold one while
    // waiting for this loop to drain the request queue.
    loop {
        let event = tokio::select! {
            _ = &mut shutdown => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!("mqtt connected");
                if let Some(previous) = announcing.take() {
                    previous.abort();
                }
                announcing = Some(tokio::spawn(announce(state.clone(), session.clone())));
            }
            Ok(Event::Incoming(Incoming::Publish(message))) => {
                let state = state.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    handle_publish(&state, &session, message.topic, message.payload.to_vec())
                        .await;
                });
            }
            Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    warn!(pkid = ack.pkid, "broker rejected a subscription");
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!("mqtt connection lost: {}", transport_failure(err));
                if let Some(task) = announcing.take() {
                    task.abort();
                }
                let session = session.clone();
                tokio::spawn(async move {
                    *session.published.lock().await = None;
                });

                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }

    if let Some(task) = announcing {
        task.abort();
    }
    mirror.abort();
    disconnect(&session, &mut eventloop).await;
}

/// Per-connection announce: description tree, subscriptions, one-shot retained intake,
/// current values and finally `ready`.
async fn announce(state: AppState, session: Arc<Session>) {
    let client = &session.client;
    let topics = &session.topics;

    *session.retained.lock().await = RetainedSync::new();
    *session.published.lock().await = None;

    publish_logged(client, topics.state(), DeviceState::Init.as_str()).await;
    for (relative, payload) in homie::description(&session.device_name) {
        publish_logged(client, topics.attribute(&relative), payload).await;
    }

    for id in PropertyId::all().into_iter().filter(|id| id.settable()) {
        subscribe_logged(client, topics.set(id)).await;
        subscribe_logged(client, topics.property(id)).await;
    }

    tokio::time::sleep(session.settle).await;
    let unclaimed = session.retained.lock().await.close();
    for id in unclaimed {
        unsubscribe_logged(client, topics.property(id)).await;
    }

    let mut published = session.published.lock().await;
    let snapshot = state.current_properties();
    for (id, payload) in snapshot.payloads() {
        publish_logged(client, topics.property(id), payload).await;
    }
    *published = Some(snapshot);
    publish_logged(client, topics.state(), DeviceState::Ready.as_str()).await;
    info!("mqtt device ready");
}

/// Republishes properties whose value changed since the last announcement.
async fn mirror_properties(state: AppState, session: Arc<Session>) {
    let mut properties = state.properties();
    while properties.changed().await.is_ok() {
        let current = properties.borrow_and_update().clone();

        let mut published = session.published.lock().await;
        let Some(previous) = published.as_mut() else {
            continue;
        };
        for (id, payload) in current.changed_since(previous) {
            publish_logged(&session.client, session.topics.property(id), payload).await;
        }
        *previous = current;
    }
}

async fn handle_publish(state: &AppState, session: &Session, topic: String, payload: Vec<u8>) {
    let Some((id, is_set)) = session.topics.parse(&topic) else {
        debug!(%topic, "ignoring unrelated topic");
        return;
    };
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(%topic, bytes = payload.len(), "dropping oversized mqtt payload");
        return;
    }

    let route = session.retained.lock().await.route(id, is_set);
    match route {
        Route::Ignore => debug!(%topic, "ignoring retained echo"),
        Route::Initial(id) => {
            unsubscribe_detached(&session.client, session.topics.property(id));
            // An empty retained payload means the topic was cleared.
            if !payload.is_empty() {
                apply_payload(state, id, &payload).await;
            }
        }
        Route::Command(id) => {
            let before = state.current_properties().payload(id);
            apply_payload(state, id, &payload).await;
            let after = state.current_properties().payload(id);
            // Changed values go out through the mirror; unchanged ones are echoed here.
            if before == after {
                publish_detached(&session.client, session.topics.property(id), after);
            }
        }
    }
}

async fn apply_payload(state: &AppState, id: PropertyId, payload: &[u8]) {
    let Ok(text) = std::str::from_utf8(payload) else {
        warn!(property = %id.path(), "dropping non utf8 payload");
        return;
    };

    let command = match id.decode(text) {
        Ok(command) => command,
        Err(err) => {
            warn!(property = %id.path(), "dropping payload: {err}");
            return;
        }
    };

    match state.apply_command(command).await {
        Ok(()) => debug!(property = %id.path(), ?command, "applied remote value"),
        Err(err) => warn!(property = %id.path(), "remote value rejected: {err}"),
    }
}

fn transport_failure(err: impl Display) -> Error {
    Error::TransportFailure(err.to_string())
}

/// Queues a retained publish. Fails once the event loop is gone.
async fn publish(client: &AsyncClient, topic: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
    client
        .publish(topic, QoS::AtLeastOnce, true, payload)
        .await
        .map_err(transport_failure)
}

async fn publish_logged(client: &AsyncClient, topic: String, payload: impl Into<Vec<u8>>) {
    if let Err(err) = publish(client, &topic, payload).await {
        warn!(%topic, "mqtt publish failed: {err}");
    }
}

fn publish_detached(client: &AsyncClient, topic: String, payload: String) {
    let client = client.clone();
    tokio::spawn(async move {
        publish_logged(&client, topic, payload).await;
    });
}

async fn subscribe_logged(client: &AsyncClient, topic: String) {
    let result = client
        .subscribe(&topic, QoS::AtLeastOnce)
        .await
        .map_err(transport_failure);
    if let Err(err) = result {
        warn!(%topic, "mqtt subscribe failed: {err}");
    }
}

async fn unsubscribe_logged(client: &AsyncClient, topic: String) {
    if let Err(err) = client.unsubscribe(&topic).await.map_err(transport_failure) {
        warn!(%topic, "mqtt unsubscribe failed: {err}");
    }
}

fn unsubscribe_detached(client: &AsyncClient, topic: String) {
    let client = client.clone();
    tokio::spawn(async move {
        unsubscribe_logged(&client, topic).await;
    });
}

/// Queues the retained `disconnected` marker, then the disconnect packet behind it.
fn queue_disconnect(session: &Session) -> Result<()> {
    let marker = session
        .client
        .try_publish(
            session.topics.state(),
            QoS::AtLeastOnce,
            true,
            DeviceState::Disconnected.as_str(),
        )
        .map_err(transport_failure);
    if let Err(err) = marker {
        warn!("failed to queue disconnected marker: {err}");
    }
    session.client.try_disconnect().map_err(transport_failure)
}

async fn disconnect(session: &Session, eventloop: &mut EventLoop) {
    if let Err(err) = queue_disconnect(session) {
        warn!("failed to queue mqtt disconnect: {err}");
        return;
    }

    let drain = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!("mqtt closed: {err}");
                    break;
                }
            }
        }
    };
    match tokio::time::timeout(DISCONNECT_GRACE, drain).await {
        Ok(()) => info!("mqtt disconnected"),
        Err(_) => warn!("mqtt disconnect timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing;
    use pretty_assertions::assert_eq;
    use rumqttc::Request;
    use sunrise_common::DayOfWeek;

    #[derive(Debug, Clone, PartialEq)]
    enum Queued {
        Publish(String, String),
        Subscribe(String),
        Unsubscribe(String),
        Disconnect,
        Other,
    }

    // Large enough that a full announce never waits on the unpolled event loop.
    fn session() -> (Session, EventLoop) {
        let options = MqttOptions::new("sunrise-test", "localhost", 1883);
        let (client, eventloop) = AsyncClient::new(options, 1024);
        let session = Session::new(
            client,
            Topics::new("homie", "sunrise"),
            "sunrise".to_string(),
            Duration::from_millis(10),
        );
        (session, eventloop)
    }

    async fn deliver(state: &AppState, session: &Session, topic: &str, payload: &str) {
        handle_publish(state, session, topic.to_string(), payload.as_bytes().to_vec()).await;
    }

    /// Everything the client has handed to the event loop so far, in order.
    fn queued(eventloop: &mut EventLoop) -> Vec<Queued> {
        eventloop.clean();
        eventloop
            .pending
            .drain(..)
            .map(|request| match request {
                Request::Publish(publish) => Queued::Publish(
                    publish.topic,
                    String::from_utf8_lossy(&publish.payload).into_owned(),
                ),
                Request::Subscribe(subscribe) => {
                    Queued::Subscribe(subscribe.filters[0].path.clone())
                }
                Request::Unsubscribe(unsubscribe) => {
                    Queued::Unsubscribe(unsubscribe.topics[0].clone())
                }
                Request::Disconnect(_) => Queued::Disconnect,
                _ => Queued::Other,
            })
            .collect()
    }

    fn is_attribute(topic: &str) -> bool {
        topic.rsplit('/').next().is_some_and(|last| last.starts_with('$'))
    }

    #[tokio::test]
    async fn retained_value_is_taken_once() {
        let (state, _shutdown) = testing::state();
        let (session, _eventloop) = session();

        deliver(&state, &session, "homie/sunrise/light/on", "1").await;
        assert!(state.status().await.on);

        state.set_on(false).await;
        // The device's own earlier publish coming back must not switch the light on again.
        deliver(&state, &session, "homie/sunrise/light/on", "1").await;
        assert!(!state.status().await.on);

        deliver(&state, &session, "homie/sunrise/light/on/set", "1").await;
        assert!(state.status().await.on);
    }

    #[tokio::test]
    async fn commands_update_the_schedule() {
        let (state, _shutdown) = testing::state();
        let (session, _eventloop) = session();

        deliver(&state, &session, "homie/sunrise/alarm/Tuesday/set", "05:45").await;
        deliver(&state, &session, "homie/sunrise/alarm/TuesdayEnabled/set", "true").await;
        deliver(&state, &session, "homie/sunrise/alarm/wake-up-length/set", "25").await;
        deliver(&state, &session, "homie/sunrise/light/brightness/set", "60").await;

        let properties = state.current_properties();
        let tuesday = properties.schedule[DayOfWeek::Tuesday];
        assert!(tuesday.enabled);
        assert_eq!(tuesday.time_of_day.to_string(), "05:45");
        assert_eq!(properties.wake_up_length.num_minutes(), 25);
        assert!((properties.gain - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn malformed_payloads_are_dropped() {
        let (state, _shutdown) = testing::state();
        let (session, _eventloop) = session();
        let before = state.current_properties();

        deliver(&state, &session, "homie/sunrise/alarm/Monday/set", "25:99").await;
        deliver(&state, &session, "homie/sunrise/alarm/wake-up-length/set", "soon").await;
        deliver(&state, &session, "homie/sunrise/light/brightness/set", "250").await;
        deliver(&state, &session, "homie/sunrise/light/on/set", "maybe").await;
        handle_publish(
            &state,
            &session,
            "homie/sunrise/light/on/set".to_string(),
            vec![0xff, 0xfe],
        )
        .await;

        assert_eq!(state.current_properties(), before);
    }

    #[tokio::test]
    async fn unrelated_and_oversized_messages_are_ignored() {
        let (state, _shutdown) = testing::state();
        let (session, _eventloop) = session();

        deliver(&state, &session, "homie/other/light/on/set", "1").await;
        deliver(&state, &session, "homie/sunrise/light/$name", "1").await;
        let oversized = "1".repeat(MAX_MQTT_PAYLOAD_BYTES + 1);
        deliver(&state, &session, "homie/sunrise/light/on/set", &oversized).await;

        assert!(!state.status().await.on);
    }

    #[tokio::test(start_paused = true)]
    async fn announce_goes_from_init_through_subscriptions_to_ready() {
        let (state, _shutdown) = testing::state();
        let (session, mut eventloop) = session();
        let topics = session.topics.clone();
        let session = Arc::new(session);

        announce(state.clone(), session.clone()).await;
        let requests = queued(&mut eventloop);

        let state_topic = topics.state();
        assert_eq!(
            requests.first(),
            Some(&Queued::Publish(state_topic.clone(), "init".to_string()))
        );
        assert_eq!(
            requests.last(),
            Some(&Queued::Publish(state_topic.clone(), "ready".to_string()))
        );

        let first_subscribe = requests
            .iter()
            .position(|request| matches!(request, Queued::Subscribe(_)))
            .unwrap();
        let last_subscribe = requests
            .iter()
            .rposition(|request| matches!(request, Queued::Subscribe(_)))
            .unwrap();

        let description = &requests[1..first_subscribe];
        assert_eq!(description.len(), homie::description("sunrise").len());
        assert!(description.iter().all(|request| matches!(
            request,
            Queued::Publish(topic, _) if is_attribute(topic) && *topic != state_topic
        )));

        let ids = PropertyId::all();
        let expected_subscriptions: Vec<Queued> = ids
            .iter()
            .flat_map(|&id| {
                [
                    Queued::Subscribe(topics.set(id)),
                    Queued::Subscribe(topics.property(id)),
                ]
            })
            .collect();
        assert_eq!(
            requests[first_subscribe..=last_subscribe].to_vec(),
            expected_subscriptions
        );

        // Nothing retained arrived, so every bare topic is dropped before values go out.
        let tail = &requests[last_subscribe + 1..requests.len() - 1];
        let (unsubscribed, values) = tail.split_at(ids.len());
        let mut unsubscribed = unsubscribed.to_vec();
        unsubscribed.sort_by_key(|request| format!("{request:?}"));
        let mut expected_unsubscribed: Vec<Queued> = ids
            .iter()
            .map(|&id| Queued::Unsubscribe(topics.property(id)))
            .collect();
        expected_unsubscribed.sort_by_key(|request| format!("{request:?}"));
        assert_eq!(unsubscribed, expected_unsubscribed);

        let expected_values: Vec<Queued> = state
            .current_properties()
            .payloads()
            .into_iter()
            .map(|(id, payload)| Queued::Publish(topics.property(id), payload))
            .collect();
        assert_eq!(values.to_vec(), expected_values);

        assert_eq!(
            *session.published.lock().await,
            Some(state.current_properties())
        );
    }

    #[tokio::test]
    async fn disconnected_marker_is_queued_before_the_disconnect() {
        let (session, mut eventloop) = session();

        queue_disconnect(&session).unwrap();

        assert_eq!(
            queued(&mut eventloop),
            vec![
                Queued::Publish(
                    "homie/sunrise/$state".to_string(),
                    "disconnected".to_string()
                ),
                Queued::Disconnect,
            ]
        );
    }

    #[tokio::test]
    async fn closed_event_loop_is_a_transport_failure() {
        let (session, eventloop) = session();
        drop(eventloop);

        let result = publish(&session.client, &session.topics.state(), "ready").await;
        assert!(matches!(result, Err(Error::TransportFailure(_))));
        assert!(matches!(
            queue_disconnect(&session),
            Err(Error::TransportFailure(_))
        ));
    }
}
