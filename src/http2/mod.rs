//! HTTP/2 session state machine (C8): per-connection frame dispatch,
//! stream table, flow control and SETTINGS negotiation layered on the
//! raw frame codec in [`frame`].

pub mod frame;
pub mod hpack;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use tracing::{trace, warn};

use crate::buffer::PayloadQueue;
use crate::callback::CallbackContainer;
use frame::{flags, FrameType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client,
}

/// Error kinds mapped onto the session's reject/goaway codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H2Error {
    Cancel,
    ConnectError,
    StreamClosed,
    RefusedStream,
    ProtocolError,
    InternalError,
    FrameSizeError,
    SettingsTimeout,
    CompressionError,
    EnhanceYourCalm,
    Http11Required,
    FlowControlError,
    InadequateSecurity,
}

impl H2Error {
    pub fn code(self) -> u32 {
        use H2Error::*;
        match self {
            ProtocolError => 0x1,
            InternalError => 0x2,
            FlowControlError => 0x3,
            SettingsTimeout => 0x4,
            StreamClosed => 0x5,
            FrameSizeError => 0x6,
            RefusedStream => 0x7,
            Cancel => 0x8,
            CompressionError => 0x9,
            ConnectError => 0xa,
            EnhanceYourCalm => 0xb,
            InadequateSecurity => 0xc,
            Http11Required => 0xd,
        }
    }
}

/// Negotiated SETTINGS values.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub streams: u32,
    pub connect: bool,
    pub frame_size: u32,
    pub enable_push: bool,
    pub window_size: u32,
    pub payload_size: u32,
    pub enable_altsvc: bool,
    pub enable_origin: bool,
    pub header_table_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            streams: 100,
            connect: false,
            frame_size: 16_384,
            enable_push: false,
            window_size: 65_535,
            payload_size: 16_384,
            enable_altsvc: false,
            enable_origin: false,
            header_table_size: 4_096,
        }
    }
}

impl Settings {
    fn to_wire(self) -> Vec<(u16, u32)> {
        vec![
            (0x3, self.streams),
            (0x8, self.connect as u32),
            (0x5, self.frame_size),
            (0x2, self.enable_push as u32),
            (0x4, self.window_size),
            (0x1, self.header_table_size),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    ReservedLocal,
    Closed,
}

struct Stream {
    id: u32,
    state: StreamState,
    local_window: i64,
    remote_window: i64,
    payloads: PayloadQueue,
}

impl Stream {
    fn new(id: u32, initial_window: u32) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            local_window: initial_window as i64,
            remote_window: initial_window as i64,
            payloads: PayloadQueue::new(),
        }
    }
}

/// Event kinds the single-event invariant tracks; `event == None` means
/// no submit-class call is currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Headers,
    Data,
    Trailers,
    Push,
    Goaway,
}

pub const TRIGGER_CALLBACK_ID: u64 = 1;

/// Per-connection HTTP/2 state. Owns the stream table, the local/remote
/// HPACK table-size tracking and the egress flow-control buffers.
pub struct Http2Session {
    mode: Mode,
    local_settings: Settings,
    remote_settings: Settings,
    local_table_size: u32,
    remote_table_size: u32,
    streams: HashMap<u32, Stream>,
    next_local_stream_id: u32,
    last_remote_stream_id: u32,
    event: Option<Event>,
    callbacks: CallbackContainer,
    goaway_sent: bool,
    egress: BytesMut,
}

impl Http2Session {
    pub fn init(mode: Mode, settings: Settings) -> Self {
        let next_local_stream_id = match mode {
            // Server-initiated streams (PUSH_PROMISE) use even ids.
            Mode::Server => 2,
            Mode::Client => 1,
        };
        Self {
            mode,
            local_settings: settings,
            remote_settings: Settings::default(),
            local_table_size: settings.header_table_size,
            remote_table_size: Settings::default().header_table_size,
            streams: HashMap::new(),
            next_local_stream_id,
            last_remote_stream_id: 0,
            event: None,
            callbacks: CallbackContainer::new(),
            goaway_sent: false,
            egress: BytesMut::new(),
        }
    }

    pub fn callbacks(&self) -> &CallbackContainer {
        &self.callbacks
    }

    pub fn callbacks_mut(&mut self) -> &mut CallbackContainer {
        &mut self.callbacks
    }

    /// Bytes the session wants written to the peer since the last call;
    /// drains the internal egress buffer.
    pub fn take_egress(&mut self) -> Bytes {
        std::mem::take(&mut self.egress).freeze()
    }

    fn begin_event(&mut self, event: Event) {
        self.event = Some(event);
    }

    /// Clears the in-flight event and, if no further submit is pending,
    /// fires the registered trigger callback (id=1): exactly one event may
    /// be in flight per session at a time.
    pub fn completed(&mut self, event_complete: bool) {
        if event_complete {
            self.event = None;
            if self.callbacks.exists(TRIGGER_CALLBACK_ID) {
                self.callbacks.call(TRIGGER_CALLBACK_ID, &[]);
            }
        }
    }

    fn event_in_flight(&self) -> bool {
        self.event.is_some()
    }

    /// Feeds ingress bytes. Fires, in order per frame: `begin`, `header*`,
    /// `chunk*`, `frameRecv`, possibly `close`.
    pub fn frame(&mut self, bytes: &[u8]) {
        let mut input = Bytes::copy_from_slice(bytes);
        let frames = frame::parse_frames(&mut input);
        for f in frames {
            self.dispatch_frame(f);
        }
    }

    fn dispatch_frame(&mut self, f: frame::Frame) {
        let sid = f.header.stream_id;
        self.callbacks.call_by_name("begin", &[boxed(sid)]);
        match f.header.frame_type {
            FrameType::Settings => self.handle_settings(&f),
            FrameType::Headers => self.handle_headers(sid, &f),
            FrameType::Data => self.handle_data(sid, &f),
            FrameType::WindowUpdate => self.handle_window_update(sid, &f),
            FrameType::RstStream => self.close_stream(sid),
            FrameType::Ping => self.handle_ping(&f),
            FrameType::Goaway => self.handle_goaway(&f),
            FrameType::PriorityUpdate | FrameType::Priority => {
                trace!(stream = sid, "ignoring priority frame");
            }
            FrameType::AltSvc | FrameType::Origin => {
                trace!(stream = sid, "ignoring extension frame");
            }
            FrameType::PushPromise | FrameType::Continuation => {
                warn!(stream = sid, "unexpected frame type from peer");
            }
        }
        self.callbacks.call_by_name("frameRecv", &[boxed(sid)]);
    }

    fn handle_settings(&mut self, f: &frame::Frame) {
        if f.header.flags & flags::ACK != 0 {
            return;
        }
        let mut chunks = f.payload.chunks_exact(6);
        for chunk in &mut chunks {
            let id = u16::from_be_bytes([chunk[0], chunk[1]]);
            let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
            match id {
                0x1 => self.remote_table_size = value,
                0x2 => self.remote_settings.enable_push = value != 0,
                0x3 => self.remote_settings.streams = value,
                0x4 => self.remote_settings.window_size = value,
                0x5 => self.remote_settings.frame_size = value,
                0x8 => self.remote_settings.connect = value != 0,
                _ => {}
            }
        }
        let ack = frame::encode_frame(FrameType::Settings, flags::ACK, 0, &[]);
        self.egress.extend_from_slice(&ack);
    }

    fn handle_headers(&mut self, sid: u32, f: &frame::Frame) {
        let stream = self
            .streams
            .entry(sid)
            .or_insert_with(|| Stream::new(sid, self.local_settings.window_size));
        stream.state = StreamState::Open;
        self.last_remote_stream_id = self.last_remote_stream_id.max(sid);
        match hpack::decode(&f.payload) {
            Ok(headers) => self.emit_headers(sid, &headers),
            Err(_) => self.reject(sid, H2Error::CompressionError),
        }
        if f.header.flags & flags::END_STREAM != 0 {
            self.half_close_remote(sid);
        }
    }

    fn emit_headers(&mut self, sid: u32, headers: &HeaderMap) {
        for (name, value) in headers.iter() {
            let pair = format!("{}: {}", name.as_str(), value.to_str().unwrap_or(""));
            self.callbacks
                .call_by_name("header", &[boxed(sid), boxed(pair)]);
        }
    }

    fn handle_data(&mut self, sid: u32, f: &frame::Frame) {
        if let Some(stream) = self.streams.get_mut(&sid) {
            stream.local_window -= f.payload.len() as i64;
        }
        self.callbacks
            .call_by_name("chunk", &[boxed(sid), boxed(f.payload.to_vec())]);
        if f.header.flags & flags::END_STREAM != 0 {
            self.half_close_remote(sid);
        }
        self.credit_local_window(sid, f.payload.len() as u32);
    }

    fn credit_local_window(&mut self, sid: u32, consumed: u32) {
        if consumed == 0 {
            return;
        }
        let update = frame::encode_frame(FrameType::WindowUpdate, 0, sid, &consumed.to_be_bytes());
        self.egress.extend_from_slice(&update);
        let conn_update = frame::encode_frame(FrameType::WindowUpdate, 0, 0, &consumed.to_be_bytes());
        self.egress.extend_from_slice(&conn_update);
    }

    fn handle_window_update(&mut self, sid: u32, f: &frame::Frame) {
        if f.payload.len() < 4 {
            return;
        }
        let increment = u32::from_be_bytes([f.payload[0], f.payload[1], f.payload[2], f.payload[3]]) & 0x7fff_ffff;
        if let Some(stream) = self.streams.get_mut(&sid) {
            stream.remote_window += increment as i64;
        }
        self.drain_payloads(sid);
    }

    fn handle_ping(&mut self, f: &frame::Frame) {
        if f.header.flags & flags::ACK != 0 {
            return;
        }
        let pong = frame::encode_frame(FrameType::Ping, flags::ACK, 0, &f.payload);
        self.egress.extend_from_slice(&pong);
    }

    fn handle_goaway(&mut self, f: &frame::Frame) {
        self.callbacks.call_by_name("close", &[]);
        for stream in self.streams.values_mut() {
            stream.state = StreamState::Closed;
        }
        let _ = f;
    }

    fn half_close_remote(&mut self, sid: u32) {
        if let Some(stream) = self.streams.get_mut(&sid) {
            stream.state = match stream.state {
                StreamState::HalfClosedLocal => StreamState::Closed,
                _ => StreamState::HalfClosedRemote,
            };
            if stream.state == StreamState::Closed {
                self.callbacks.call_by_name("close", &[boxed(sid)]);
            }
        }
    }

    fn close_stream(&mut self, sid: u32) {
        if let Some(stream) = self.streams.get_mut(&sid) {
            stream.state = StreamState::Closed;
        }
        self.callbacks.call_by_name("close", &[boxed(sid)]);
    }

    /// Submits response headers for `sid`. Headers themselves are not
    /// subject to flow control; only DATA frames are.
    pub fn send_headers(&mut self, sid: u32, headers: &HeaderMap, end_stream: bool) {
        self.begin_event(Event::Headers);
        let stream = self
            .streams
            .entry(sid)
            .or_insert_with(|| Stream::new(sid, self.remote_settings.window_size));
        stream.state = StreamState::Open;
        let block = hpack::encode(headers);
        let mut fl = flags::END_HEADERS;
        if end_stream {
            fl |= flags::END_STREAM;
        }
        let encoded = frame::encode_frame(FrameType::Headers, fl, sid, &block);
        self.egress.extend_from_slice(&encoded);
        if end_stream {
            self.half_close_local(sid);
        }
        self.callbacks.call_by_name("frameSend", &[boxed(sid)]);
        self.completed(true);
    }

    /// Submits body bytes, gated by `available(sid)`; any excess is
    /// buffered and drained on WINDOW_UPDATE.
    pub fn send_data(&mut self, sid: u32, data: &[u8], end_stream: bool) -> usize {
        self.begin_event(Event::Data);
        let written = self.write_data_frame(sid, data, end_stream);
        if written < data.len() {
            if let Some(stream) = self.streams.get_mut(&sid) {
                stream.payloads.push(data[written..].to_vec());
            }
        }
        self.completed(true);
        written
    }

    fn write_data_frame(&mut self, sid: u32, data: &[u8], end_stream: bool) -> usize {
        let avail = self.available(sid).min(self.local_settings.frame_size as usize);
        let take = data.len().min(avail);
        if take == 0 {
            return 0;
        }
        if let Some(stream) = self.streams.get_mut(&sid) {
            stream.remote_window -= take as i64;
        }
        let mut fl = 0;
        if end_stream && take == data.len() {
            fl |= flags::END_STREAM;
        }
        let frame = frame::encode_frame(FrameType::Data, fl, sid, &data[..take]);
        self.egress.extend_from_slice(&frame);
        self.callbacks.call_by_name("frameSend", &[boxed(sid)]);
        if fl & flags::END_STREAM != 0 {
            self.half_close_local(sid);
        }
        take
    }

    /// Bytes currently permitted by the peer's advertised window for `sid`.
    pub fn available(&self, sid: u32) -> usize {
        self.streams
            .get(&sid)
            .map(|s| s.remote_window.max(0) as usize)
            .unwrap_or(0)
    }

    fn drain_payloads(&mut self, sid: u32) {
        loop {
            let Some(stream) = self.streams.get_mut(&sid) else { return };
            if stream.payloads.is_empty() {
                return;
            }
            let avail = stream.remote_window.max(0) as usize;
            if avail == 0 {
                return;
            }
            let Some(chunk) = stream.payloads.front_mut() else { return };
            let remaining = chunk.bytes.len() - chunk.offset;
            let take = remaining.min(avail).min(self.local_settings.frame_size as usize);
            if take == 0 {
                return;
            }
            let data = chunk.bytes[chunk.offset..chunk.offset + take].to_vec();
            chunk.offset += take;
            drop(chunk);
            self.write_data_frame(sid, &data, false);
            if let Some(s) = self.streams.get_mut(&sid) {
                s.payloads.reap_drained();
            }
        }
    }

    pub fn send_trailers(&mut self, sid: u32, trailers: &HeaderMap) {
        self.begin_event(Event::Trailers);
        let block = hpack::encode(trailers);
        let encoded = frame::encode_frame(FrameType::Headers, flags::END_HEADERS | flags::END_STREAM, sid, &block);
        self.egress.extend_from_slice(&encoded);
        self.half_close_local(sid);
        self.completed(true);
    }

    /// Submits a server push, reserving a new even-numbered stream id.
    pub fn send_push(&mut self, associated_sid: u32, headers: &HeaderMap) -> Option<u32> {
        if !self.remote_settings.enable_push {
            return None;
        }
        self.begin_event(Event::Push);
        let push_id = self.next_local_stream_id;
        self.next_local_stream_id += 2;
        let mut stream = Stream::new(push_id, self.remote_settings.window_size);
        stream.state = StreamState::ReservedLocal;
        self.streams.insert(push_id, stream);
        let mut payload = BytesMut::new();
        payload.extend_from_slice(&push_id.to_be_bytes());
        payload.extend_from_slice(&hpack::encode(headers));
        let frame = frame::encode_frame(FrameType::PushPromise, flags::END_HEADERS, associated_sid, &payload);
        self.egress.extend_from_slice(&frame);
        self.completed(true);
        Some(push_id)
    }

    fn half_close_local(&mut self, sid: u32) {
        if let Some(stream) = self.streams.get_mut(&sid) {
            stream.state = match stream.state {
                StreamState::HalfClosedRemote => StreamState::Closed,
                _ => StreamState::HalfClosedLocal,
            };
            if stream.state == StreamState::Closed {
                self.callbacks.call_by_name("close", &[boxed(sid)]);
            }
        }
    }

    pub fn reject(&mut self, sid: u32, err: H2Error) {
        let frame = frame::encode_frame(FrameType::RstStream, 0, sid, &err.code().to_be_bytes());
        self.egress.extend_from_slice(&frame);
        self.close_stream(sid);
    }

    pub fn goaway(&mut self, last_id: u32, err: H2Error, debug: Option<&[u8]>) {
        self.begin_event(Event::Goaway);
        let mut payload = BytesMut::new();
        payload.extend_from_slice(&last_id.to_be_bytes());
        payload.extend_from_slice(&err.code().to_be_bytes());
        if let Some(d) = debug {
            payload.extend_from_slice(d);
        }
        let frame = frame::encode_frame(FrameType::Goaway, 0, 0, &payload);
        self.egress.extend_from_slice(&frame);
        self.goaway_sent = true;
        self.completed(true);
    }

    pub fn ping(&mut self) {
        let frame = frame::encode_frame(FrameType::Ping, 0, 0, &[0u8; 8]);
        self.egress.extend_from_slice(&frame);
    }

    pub fn shutdown(&mut self) {
        if !self.goaway_sent {
            self.goaway(self.last_remote_stream_id, H2Error::Cancel, None);
        }
    }

    pub fn free(&mut self) {
        self.streams.clear();
    }

    pub fn local_table_size(&self) -> u32 {
        self.local_table_size
    }

    pub fn remote_table_size(&self) -> u32 {
        self.remote_table_size
    }

    pub fn event_in_flight_for_tests(&self) -> bool {
        self.event_in_flight()
    }

    /// Encodes the initial SETTINGS frame to send on connection open.
    pub fn initial_settings_frame(&self) -> Bytes {
        let mut payload = BytesMut::new();
        for (id, value) in self.local_settings.to_wire() {
            payload.extend_from_slice(&id.to_be_bytes());
            payload.extend_from_slice(&value.to_be_bytes());
        }
        frame::encode_frame(FrameType::Settings, 0, 0, &payload)
    }
}

fn boxed<T: Any + Send + Sync>(value: T) -> Arc<dyn Any + Send + Sync> {
    Arc::new(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn client_headers(session: &mut Http2Session, sid: u32, headers: HeaderMap, end_stream: bool) -> Bytes {
        session.send_headers(sid, &headers, end_stream);
        session.take_egress()
    }

    #[test]
    fn settings_ack_echoes_on_ingress() {
        let mut session = Http2Session::init(Mode::Server, Settings::default());
        let settings_frame = frame::encode_frame(FrameType::Settings, 0, 0, &[]);
        session.frame(&settings_frame);
        let egress = session.take_egress();
        let header = frame::parse_header(&egress[..frame::FRAME_HEADER_LEN]).unwrap();
        assert!(matches!(header.frame_type, FrameType::Settings));
        assert_eq!(header.flags, flags::ACK);
    }

    #[test]
    fn send_headers_fires_frame_send_and_clears_event() {
        let mut session = Http2Session::init(Mode::Server, Settings::default());
        let mut headers = HeaderMap::new();
        headers.insert(":status", HeaderValue::from_static("200"));
        let egress = client_headers(&mut session, 1, headers, true);
        assert!(!egress.is_empty());
        assert!(!session.event_in_flight_for_tests());
    }

    #[test]
    fn send_data_buffers_excess_past_peer_window() {
        let mut session = Http2Session::init(Mode::Server, Settings::default());
        session.streams.insert(1, Stream::new(1, 10));
        let data = vec![1u8; 30];
        let written = session.send_data(1, &data, true);
        assert_eq!(written, 10);
        let stream = session.streams.get(&1).unwrap();
        assert_eq!(stream.payloads.size(), 20);
    }

    #[test]
    fn window_update_drains_buffered_payload() {
        let mut session = Http2Session::init(Mode::Server, Settings::default());
        session.streams.insert(1, Stream::new(1, 10));
        session.send_data(1, &vec![7u8; 30], false);
        assert_eq!(session.streams.get(&1).unwrap().payloads.size(), 20);
        let update = frame::encode_frame(FrameType::WindowUpdate, 0, 1, &20u32.to_be_bytes());
        session.frame(&update);
        assert_eq!(session.streams.get(&1).unwrap().payloads.size(), 0);
    }

    #[test]
    fn goaway_sets_and_clears_single_event() {
        let mut session = Http2Session::init(Mode::Server, Settings::default());
        session.goaway(0, H2Error::ProtocolError, None);
        assert!(!session.event_in_flight_for_tests());
        let egress = session.take_egress();
        let header = frame::parse_header(&egress[..frame::FRAME_HEADER_LEN]).unwrap();
        assert!(matches!(header.frame_type, FrameType::Goaway));
    }
}
