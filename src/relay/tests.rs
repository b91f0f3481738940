use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

use super::*;
use crate::config::ModelConfig;
use crate::realtime::DialError;
use crate::session::Outbound;

/// Hands out in-memory model sockets and remembers their outbound queues.
#[derive(Clone, Default)]
struct FakeDialer {
    sockets: Arc<Mutex<Vec<(ConnId, UnboundedReceiver<Outbound>)>>>,
    dials: Arc<AtomicUsize>,
    refuse: bool,
}

#[async_trait]
impl ModelDialer for FakeDialer {
    async fn dial(&self, api_key: &str, id: ConnId, relay: RelayHandle) -> Result<(), DialError> {
        assert_eq!(api_key, "sk-test");
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(DialError::Request("refused".into()));
        }
        let (conn, rx) = Connection::open(id, Role::Model);
        self.sockets.lock().unwrap().push((id, rx));
        relay.send(RelayEvent::ModelOpened(conn));
        Ok(())
    }
}

struct Harness {
    relay: Relay,
    events: UnboundedReceiver<RelayEvent>,
    dialer: FakeDialer,
}

impl Harness {
    fn new() -> Self {
        Self::with_dialer(FakeDialer::default())
    }

    fn with_dialer(dialer: FakeDialer) -> Self {
        let registry = crate::capabilities::builtin().unwrap();
        let settings = RelaySettings {
            api_key: "sk-test".into(),
            session_defaults: SessionConfig::defaults(&ModelConfig::default(), Vec::new()),
        };
        let (relay, events) = Relay::new(settings, Arc::new(registry), Arc::new(dialer.clone()));
        Self {
            relay,
            events,
            dialer,
        }
    }

    fn connect(&mut self, role: Role) -> (ConnId, UnboundedReceiver<Outbound>) {
        let id = self.relay.handle().next_conn_id();
        let (conn, rx) = Connection::open(id, role);
        self.relay.handle_event(RelayEvent::Connected(conn));
        (id, rx)
    }

    fn send(&mut self, role: Role, id: ConnId, message: Value) {
        self.send_raw(role, id, &message.to_string());
    }

    fn send_raw(&mut self, role: Role, id: ConnId, text: &str) {
        self.relay.handle_event(RelayEvent::Message {
            role,
            id,
            text: text.to_string(),
        });
    }

    fn close(&mut self, role: Role, id: ConnId) {
        self.relay.handle_event(RelayEvent::Closed { role, id });
    }

    /// Feed back spawned work (dials, capability results) until quiet.
    async fn settle(&mut self) {
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), self.events.recv()).await
        {
            self.relay.handle_event(event);
        }
    }

    fn take_model(&self) -> (ConnId, UnboundedReceiver<Outbound>) {
        self.dialer
            .sockets
            .lock()
            .unwrap()
            .pop()
            .expect("model was not dialled")
    }

    /// Telephony connected, stream started and model open.
    async fn start_call(
        &mut self,
        stream_sid: &str,
    ) -> (
        (ConnId, UnboundedReceiver<Outbound>),
        (ConnId, UnboundedReceiver<Outbound>),
    ) {
        let (tel, tel_rx) = self.connect(Role::Telephony);
        self.send(Role::Telephony, tel, start(stream_sid));
        self.settle().await;
        let model = self.take_model();
        ((tel, tel_rx), model)
    }
}

fn start(stream_sid: &str) -> Value {
    json!({"event": "start", "start": {"streamSid": stream_sid, "callSid": "CA1"}, "streamSid": stream_sid})
}

fn media(timestamp: u64) -> Value {
    json!({"event": "media", "media": {"timestamp": timestamp.to_string(), "payload": "AAAA"}})
}

fn audio_delta(item_id: &str) -> Value {
    json!({"type": "response.audio.delta", "item_id": item_id, "delta": "BBBB"})
}

fn speech_started() -> Value {
    json!({"type": "input_audio_buffer.speech_started", "audio_start_ms": 0})
}

fn function_call(name: &str, arguments: &str) -> Value {
    json!({
        "type": "response.output_item.done",
        "item": {"type": "function_call", "name": name, "arguments": arguments, "call_id": "call_42"}
    })
}

fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

fn json_frames(frames: &[Outbound]) -> Vec<Value> {
    frames
        .iter()
        .filter_map(|f| match f {
            Outbound::Text(text) => serde_json::from_str(text).ok(),
            Outbound::Close => None,
        })
        .collect()
}

fn closed(frames: &[Outbound]) -> bool {
    frames.contains(&Outbound::Close)
}

fn of_type<'a>(frames: &'a [Value], kind: &str) -> Vec<&'a Value> {
    frames.iter().filter(|f| f["type"] == kind).collect()
}

#[tokio::test]
async fn barge_in_truncates_at_telephony_offset() {
    let mut h = Harness::new();

    let (obs, mut obs_rx) = h.connect(Role::Observer);
    h.send(
        Role::Observer,
        obs,
        json!({"type": "session.update", "session": {"voice": "coral"}}),
    );

    let ((tel, mut tel_rx), (model, mut model_rx)) = h.start_call("SD1").await;

    let init = json_frames(&drain(&mut model_rx));
    assert_eq!(init.len(), 2);
    assert_eq!(init[0]["type"], "session.update");
    assert_eq!(init[0]["session"]["voice"], "coral");
    assert_eq!(init[0]["session"]["input_audio_format"], "g711_ulaw");
    assert_eq!(init[1], json!({"type": "response.create"}));

    h.send(Role::Telephony, tel, media(500));
    let appended = json_frames(&drain(&mut model_rx));
    assert_eq!(
        appended,
        vec![json!({"type": "input_audio_buffer.append", "audio": "AAAA"})]
    );

    h.send(Role::Model, model, audio_delta("item_1"));
    let turn = h.relay.session().assistant_turn.clone().unwrap();
    assert_eq!(turn.item_id, "item_1");
    assert_eq!(turn.started_at_ms, 500);

    let played = json_frames(&drain(&mut tel_rx));
    assert_eq!(
        played,
        vec![
            json!({"event": "media", "streamSid": "SD1", "media": {"payload": "BBBB"}}),
            json!({"event": "mark", "streamSid": "SD1"}),
        ]
    );

    h.send(Role::Telephony, tel, media(1800));
    drain(&mut model_rx);

    h.send(Role::Model, model, speech_started());

    let to_model = json_frames(&drain(&mut model_rx));
    assert_eq!(
        to_model,
        vec![json!({
            "type": "conversation.item.truncate",
            "item_id": "item_1",
            "content_index": 0,
            "audio_end_ms": 1300
        })]
    );
    let to_phone = json_frames(&drain(&mut tel_rx));
    assert_eq!(to_phone, vec![json!({"event": "clear", "streamSid": "SD1"})]);
    assert!(h.relay.session().assistant_turn.is_none());

    // The observer saw every model event verbatim
    let mirrored = json_frames(&drain(&mut obs_rx));
    assert_eq!(mirrored, vec![audio_delta("item_1"), speech_started()]);
}

#[tokio::test]
async fn later_deltas_keep_turn_start() {
    let mut h = Harness::new();
    let ((tel, _tel_rx), (model, _model_rx)) = h.start_call("SD1").await;

    h.send(Role::Telephony, tel, media(200));
    h.send(Role::Model, model, audio_delta("item_1"));
    h.send(Role::Telephony, tel, media(900));
    h.send(Role::Model, model, audio_delta("item_2"));

    let turn = h.relay.session().assistant_turn.clone().unwrap();
    assert_eq!(turn.item_id, "item_2");
    assert_eq!(turn.started_at_ms, 200);
}

#[tokio::test]
async fn truncation_without_assistant_audio_is_noop() {
    let mut h = Harness::new();
    let ((tel, mut tel_rx), (model, mut model_rx)) = h.start_call("SD1").await;
    drain(&mut model_rx);

    h.send(Role::Model, model, speech_started());
    assert!(drain(&mut model_rx).is_empty());
    assert!(drain(&mut tel_rx).is_empty());

    // A second speech-started after a real truncation is also a no-op
    h.send(Role::Telephony, tel, media(100));
    h.send(Role::Model, model, audio_delta("item_1"));
    h.send(Role::Model, model, speech_started());
    drain(&mut model_rx);
    drain(&mut tel_rx);

    h.send(Role::Model, model, speech_started());
    assert!(of_type(&json_frames(&drain(&mut model_rx)), "conversation.item.truncate").is_empty());
    assert!(drain(&mut tel_rx).is_empty());
}

#[tokio::test]
async fn media_before_model_open_is_dropped() {
    let mut h = Harness::new();
    let (tel, _tel_rx) = h.connect(Role::Telephony);
    h.send(Role::Telephony, tel, start("SD1"));

    // Dial still in flight
    h.send(Role::Telephony, tel, media(20));
    assert_eq!(h.relay.session().latest_media_timestamp_ms, 20);

    h.settle().await;
    let (_model, mut model_rx) = h.take_model();
    let frames = json_frames(&drain(&mut model_rx));
    assert!(of_type(&frames, "input_audio_buffer.append").is_empty());

    h.send(Role::Telephony, tel, media(40));
    let frames = json_frames(&drain(&mut model_rx));
    assert_eq!(of_type(&frames, "input_audio_buffer.append").len(), 1);
}

#[tokio::test]
async fn model_is_dialled_once_per_call() {
    let mut h = Harness::new();
    let (tel, _tel_rx) = h.connect(Role::Telephony);
    h.send(Role::Telephony, tel, start("SD1"));
    h.send(Role::Telephony, tel, start("SD1"));
    h.settle().await;
    h.send(Role::Telephony, tel, start("SD2"));
    h.settle().await;

    assert_eq!(h.dialer.dials.load(Ordering::SeqCst), 1);
    assert_eq!(h.relay.session().stream_sid.as_deref(), Some("SD2"));
}

#[tokio::test]
async fn start_resets_call_clock_and_turn() {
    let mut h = Harness::new();
    let ((tel, _tel_rx), (model, _model_rx)) = h.start_call("SD1").await;
    h.send(Role::Telephony, tel, media(700));
    h.send(Role::Model, model, audio_delta("item_1"));

    h.send(Role::Telephony, tel, start("SD2"));

    let session = h.relay.session();
    assert_eq!(session.latest_media_timestamp_ms, 0);
    assert!(session.assistant_turn.is_none());
}

#[tokio::test]
async fn disconnect_call_closes_everything() {
    let mut h = Harness::new();
    let (_obs, mut obs_rx) = h.connect(Role::Observer);
    let ((_tel, mut tel_rx), (model, mut model_rx)) = h.start_call("SD1").await;

    h.send(
        Role::Model,
        model,
        function_call("disconnect_call", r#"{"reason":"caller hung up"}"#),
    );
    h.settle().await;

    assert!(closed(&drain(&mut tel_rx)));
    assert!(closed(&drain(&mut obs_rx)));
    let model_frames = drain(&mut model_rx);
    assert!(closed(&model_frames));
    // The model was gone before the output came back
    assert!(of_type(&json_frames(&model_frames), "conversation.item.create").is_empty());
    assert!(h.relay.session().is_vacant());
    assert!(h.relay.session().stream_sid.is_none());
}

#[tokio::test]
async fn function_output_is_fed_back_to_model() {
    let mut h = Harness::new();
    let ((_tel, _tel_rx), (model, mut model_rx)) = h.start_call("SD1").await;
    drain(&mut model_rx);

    h.send(
        Role::Model,
        model,
        function_call(
            "record_vehicle_experience",
            r#"{"vehicle":"Civic","rating":7,"feedback":"Great"}"#,
        ),
    );
    h.settle().await;

    let frames = json_frames(&drain(&mut model_rx));
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["type"], "conversation.item.create");
    assert_eq!(frames[0]["item"]["type"], "function_call_output");
    assert_eq!(frames[0]["item"]["call_id"], "call_42");
    let output: Value = serde_json::from_str(frames[0]["item"]["output"].as_str().unwrap()).unwrap();
    assert_eq!(output["rating"], 5);
    assert_eq!(output["vehicle"], "Civic");
    assert_eq!(frames[1], json!({"type": "response.create"}));
}

#[tokio::test]
async fn unknown_function_reports_error_to_model() {
    let mut h = Harness::new();
    let ((_tel, _tel_rx), (model, mut model_rx)) = h.start_call("SD1").await;
    drain(&mut model_rx);

    h.send(Role::Model, model, function_call("launch_rocket", "{}"));
    h.settle().await;

    let frames = json_frames(&drain(&mut model_rx));
    let output: Value = serde_json::from_str(frames[0]["item"]["output"].as_str().unwrap()).unwrap();
    assert_eq!(
        output,
        json!({"error": "No handler found for function: launch_rocket"})
    );
}

#[tokio::test]
async fn bad_arguments_report_error_to_model() {
    let mut h = Harness::new();
    let ((_tel, _tel_rx), (model, mut model_rx)) = h.start_call("SD1").await;
    drain(&mut model_rx);

    h.send(
        Role::Model,
        model,
        function_call("record_vehicle_experience", "{rating: 7"),
    );
    h.settle().await;

    let frames = json_frames(&drain(&mut model_rx));
    let output: Value = serde_json::from_str(frames[0]["item"]["output"].as_str().unwrap()).unwrap();
    assert_eq!(output, json!({"error": "invalid arguments"}));
}

#[tokio::test]
async fn telephony_close_event_resets_session() {
    let mut h = Harness::new();
    let (obs, mut obs_rx) = h.connect(Role::Observer);
    h.send(
        Role::Observer,
        obs,
        json!({"type": "session.update", "session": {"voice": "coral"}}),
    );
    let ((tel, mut tel_rx), (_model, mut model_rx)) = h.start_call("SD1").await;

    h.send(Role::Telephony, tel, json!({"event": "close"}));

    assert!(closed(&drain(&mut tel_rx)));
    assert!(closed(&drain(&mut model_rx)));
    assert!(closed(&drain(&mut obs_rx)));
    assert!(h.relay.session().is_vacant());
    assert!(h.relay.session().saved_config.is_none());

    // Late close notifications from those sockets change nothing
    h.close(Role::Telephony, tel);
    h.close(Role::Observer, obs);
    assert!(h.relay.session().is_vacant());
}

#[tokio::test]
async fn telephony_hangup_keeps_observer() {
    let mut h = Harness::new();
    let (_obs, mut obs_rx) = h.connect(Role::Observer);
    let ((tel, _tel_rx), (_model, mut model_rx)) = h.start_call("SD1").await;

    h.close(Role::Telephony, tel);

    assert!(closed(&drain(&mut model_rx)));
    assert!(!closed(&drain(&mut obs_rx)));
    let session = h.relay.session();
    assert!(session.observer.is_some());
    assert!(!session.model.is_attached());
    assert!(session.stream_sid.is_none());
}

#[tokio::test]
async fn preempted_telephony_cannot_tear_down_successor() {
    let mut h = Harness::new();
    let (first, mut first_rx) = h.connect(Role::Telephony);
    let (second, mut second_rx) = h.connect(Role::Telephony);

    assert!(closed(&drain(&mut first_rx)));
    assert!(!closed(&drain(&mut second_rx)));

    // The old socket's frames and close arrive late
    h.send(Role::Telephony, first, start("OLD"));
    h.close(Role::Telephony, first);

    let session = h.relay.session();
    assert!(session.is_current(Role::Telephony, second));
    assert!(session.stream_sid.is_none());
    assert_eq!(h.dialer.dials.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn observer_traffic_reaches_model() {
    let mut h = Harness::new();
    let (obs, _obs_rx) = h.connect(Role::Observer);
    let ((_tel, _tel_rx), (_model, mut model_rx)) = h.start_call("SD1").await;
    drain(&mut model_rx);

    let item = json!({
        "type": "conversation.item.create",
        "item": {"type": "message", "role": "user", "content": [{"type": "input_text", "text": "hi"}]}
    });
    h.send(Role::Observer, obs, item.clone());
    h.send(
        Role::Observer,
        obs,
        json!({"type": "session.update", "session": {"instructions": "Speak French."}}),
    );

    let frames = json_frames(&drain(&mut model_rx));
    assert_eq!(frames[0], item);
    assert_eq!(frames[1]["session"]["instructions"], "Speak French.");
    assert_eq!(
        h.relay
            .session()
            .saved_config
            .as_ref()
            .and_then(|c| c.instructions.as_deref()),
        Some("Speak French.")
    );
}

#[tokio::test]
async fn invalid_observer_config_is_relayed_but_not_saved() {
    let mut h = Harness::new();
    let (obs, _obs_rx) = h.connect(Role::Observer);
    h.send(
        Role::Observer,
        obs,
        json!({"type": "session.update", "session": {"voice": "coral"}}),
    );
    h.send(
        Role::Observer,
        obs,
        json!({"type": "session.update", "session": {"output_audio_format": "mp3"}}),
    );

    let saved = h.relay.session().saved_config.clone().unwrap();
    assert_eq!(saved.voice.as_deref(), Some("coral"));
}

#[tokio::test]
async fn malformed_frames_are_ignored() {
    let mut h = Harness::new();
    let (obs, mut obs_rx) = h.connect(Role::Observer);
    let ((tel, mut tel_rx), (model, mut model_rx)) = h.start_call("SD1").await;
    drain(&mut model_rx);

    h.send_raw(Role::Telephony, tel, "{not json");
    h.send_raw(Role::Model, model, "garbage");
    h.send_raw(Role::Observer, obs, "[]");

    assert!(drain(&mut model_rx).is_empty());
    assert!(drain(&mut tel_rx).is_empty());
    assert!(drain(&mut obs_rx).is_empty());
    assert!(h.relay.session().telephony.is_some());
}

#[tokio::test]
async fn model_drop_is_not_redialled() {
    let mut h = Harness::new();
    let ((tel, _tel_rx), (model, _model_rx)) = h.start_call("SD1").await;

    h.close(Role::Model, model);
    assert!(!h.relay.session().model.is_attached());
    assert!(h.relay.session().telephony.is_some());

    h.send(Role::Telephony, tel, media(10));
    h.settle().await;
    assert_eq!(h.dialer.dials.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_dial_clears_model_link() {
    let mut h = Harness::with_dialer(FakeDialer {
        refuse: true,
        ..FakeDialer::default()
    });
    let (tel, _tel_rx) = h.connect(Role::Telephony);
    h.send(Role::Telephony, tel, start("SD1"));
    assert!(h.relay.session().model.is_attached());

    h.settle().await;
    assert!(!h.relay.session().model.is_attached());
    assert!(h.relay.session().telephony.is_some());
}

#[tokio::test]
async fn model_opening_after_hangup_is_closed() {
    let mut h = Harness::new();
    let (tel, _tel_rx) = h.connect(Role::Telephony);
    h.send(Role::Telephony, tel, start("SD1"));
    h.close(Role::Telephony, tel);

    h.settle().await;
    let (_model, mut model_rx) = h.take_model();
    let frames = drain(&mut model_rx);
    assert_eq!(frames, vec![Outbound::Close]);
    assert!(h.relay.session().is_vacant());
}

#[tokio::test]
async fn output_from_finished_call_is_not_delivered() {
    let mut h = Harness::new();
    let ((_old_tel, _old_rx), (old_model, _old_model_rx)) = h.start_call("SD1").await;
    // A new call preempts the first one
    let ((_tel, mut tel_rx), (model, mut model_rx)) = h.start_call("SD2").await;
    assert_ne!(old_model, model);
    drain(&mut model_rx);

    h.relay.handle_event(RelayEvent::FunctionOutput {
        model: old_model,
        call_id: "call_from_SD1".into(),
        output: json!({"temp": 12}),
    });
    h.relay.handle_event(RelayEvent::DisconnectAll {
        model: old_model,
        reason: Some("caller said bye".into()),
    });

    assert!(drain(&mut model_rx).is_empty());
    assert!(!closed(&drain(&mut tel_rx)));
    assert!(h.relay.session().model.is_attached());
    assert_eq!(h.relay.session().stream_sid.as_deref(), Some("SD2"));

    h.relay.handle_event(RelayEvent::FunctionOutput {
        model,
        call_id: "call_from_SD2".into(),
        output: json!({"temp": 14}),
    });
    let frames = json_frames(&drain(&mut model_rx));
    assert_eq!(frames[0]["item"]["call_id"], "call_from_SD2");
}

#[tokio::test]
async fn hang_up_after_model_dropped_is_ignored() {
    let mut h = Harness::new();
    let ((_tel, mut tel_rx), (model, mut model_rx)) = h.start_call("SD1").await;

    h.send(Role::Model, model, function_call("disconnect_call", "{}"));
    // The socket goes away before the handler runs
    h.close(Role::Model, model);
    h.settle().await;

    assert!(closed(&drain(&mut model_rx)));
    assert!(!closed(&drain(&mut tel_rx)));
    assert!(h.relay.session().telephony.is_some());
}

#[tokio::test]
async fn observer_can_turn_off_vad() {
    let mut h = Harness::new();
    let (obs, _obs_rx) = h.connect(Role::Observer);
    h.send(
        Role::Observer,
        obs,
        json!({"type": "session.update", "session": {"turn_detection": null}}),
    );

    let ((_tel, _tel_rx), (_model, mut model_rx)) = h.start_call("SD1").await;

    let init = json_frames(&drain(&mut model_rx));
    assert_eq!(init[0]["type"], "session.update");
    assert!(init[0]["session"]
        .as_object()
        .unwrap()
        .contains_key("turn_detection"));
    assert_eq!(init[0]["session"]["turn_detection"], Value::Null);
    assert_eq!(init[0]["session"]["voice"], "ash");
}

#[tokio::test]
async fn delta_without_item_id_plays_but_starts_no_turn() {
    let mut h = Harness::new();
    let ((tel, mut tel_rx), (model, mut model_rx)) = h.start_call("SD1").await;
    h.send(Role::Telephony, tel, media(300));
    drain(&mut model_rx);

    h.send(
        Role::Model,
        model,
        json!({"type": "response.audio.delta", "delta": "CCCC"}),
    );

    let played = json_frames(&drain(&mut tel_rx));
    assert_eq!(played.len(), 2);
    assert_eq!(played[0]["media"]["payload"], "CCCC");
    assert_eq!(played[1]["event"], "mark");
    assert!(h.relay.session().assistant_turn.is_none());

    // Nothing to truncate yet
    h.send(Role::Model, model, speech_started());
    assert!(drain(&mut model_rx).is_empty());
    assert!(drain(&mut tel_rx).is_empty());

    // The first delta carrying an id starts the turn
    h.send(Role::Telephony, tel, media(450));
    h.send(Role::Model, model, audio_delta("item_9"));
    let turn = h.relay.session().assistant_turn.clone().unwrap();
    assert_eq!(turn.item_id, "item_9");
    assert_eq!(turn.started_at_ms, 450);
}
