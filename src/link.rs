// The link endpoint: TX path, receive thread, card selection and stats.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::api::{CapturedFrame, MonitorIo};
use crate::config::{ConfigError, Options};
use crate::crypto::aead::{self, AeadError};
use crate::crypto::keys::{KeyError, KeyPair, DEFAULT_SEED};
use crate::crypto::session::{
    SessionAnnouncement, SessionDecryptor, SessionEncryptor, SessionError, SessionIngest,
};
use crate::dispatch::{Dispatcher, StreamRxHandler};
use crate::metrics::{Metrics, MetricsError};
use crate::seqnr::{NonceTracker, PollutionTracker, SeqCounterTracker};
use crate::stats::{Bitrate, PacketsPerSecond, RxStats, RxStatsPerCard, SmoothedRssi, TxStats};
use crate::wire::{
    build_frame, frame_aad, parse_frame, FrameHeader, RadioPort, RadiotapParams, RadiotapTxHeader,
    WireError, MAX_USER_PAYLOAD, SESSION_KEY_PORT, STREAM_INDEX_MAX,
};

// Initial session-key burst so a late-started receiver still catches one.
const SESSION_KEY_BURST: usize = 5;
const SESSION_KEY_BURST_SPACING: Duration = Duration::from_millis(10);

// TX card re-selection cadence.
const CARD_SELECT_INTERVAL: Duration = Duration::from_secs(1);

// Rotate to a fresh session long before the nonce could wrap.
const NONCE_ROTATE_AT: u64 = 1 << 62;

const RECEIVE_ERROR_LOG_INTERVAL: Duration = Duration::from_secs(1);
const MAX_CONSECUTIVE_POLL_ERRORS: u32 = 10;

/// Errors surfaced by the endpoint.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no capture cards supplied")]
    NoCards,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Keys(#[from] KeyError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Aead(#[from] AeadError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error("failed to spawn receive thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("stream index {0} is out of range")]
    InvalidStreamIndex(u8),
    #[error("stream 0 with encryption maps onto the reserved session-key port")]
    ReservedPort,
    #[error("payload of {len} bytes exceeds the {max} byte maximum")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("transmissions are disabled")]
    TransmissionsDisabled,
}

struct TxState {
    radiotap_params: RadiotapParams,
    radiotap: RadiotapTxHeader,
    ieee_seq: u16,
    nonce: u64,
    encryptor: SessionEncryptor,
    next_announce: Instant,
    stats: TxStats,
    pps: PacketsPerSecond,
    bitrate_excluding_overhead: Bitrate,
    bitrate_including_overhead: Bitrate,
}

struct CardRx {
    rssi: SmoothedRssi,
    nonce_tracker: NonceTracker,
    count_p_any: i64,
    count_p_valid: i64,
    last_valid: Option<Instant>,
    disconnected: bool,
}

struct RxState {
    decryptor: SessionDecryptor,
    stats: RxStats,
    nonce_tracker: NonceTracker,
    pollution: PollutionTracker,
    seq_tracker: SeqCounterTracker,
    pps: PacketsPerSecond,
    bitrate: Bitrate,
    cards: Vec<CardRx>,
    // Highest nonce handed to user callbacks this session; duplicates from
    // other cards and replays never cause a second delivery.
    last_delivered: Option<u64>,
    last_card_select: Instant,
    latency_sum: Duration,
    latency_samples: u64,
    exported_callback_panics: u64,
}

struct Shared<C: MonitorIo> {
    options: Options,
    cards: Vec<Mutex<C>>,
    tx: Mutex<TxState>,
    rx: Mutex<RxState>,
    dispatcher: Dispatcher,
    metrics: Metrics,
    curr_tx_card: AtomicUsize,
    passive: AtomicBool,
    running: AtomicBool,
    receive_thread_alive: AtomicBool,
}

/// A broadcast link endpoint over one or more monitor-mode cards.
///
/// Producers call [`Endpoint::tx_inject`] from any thread; received frames
/// are validated on the dedicated receive thread and delivered to the
/// registered handlers. Callbacks run on the receive thread and must not
/// block.
pub struct Endpoint<C: MonitorIo + 'static> {
    shared: Arc<Shared<C>>,
    receive_thread: Option<JoinHandle<()>>,
}

impl<C: MonitorIo + 'static> Endpoint<C> {
    /// Builds the endpoint, loads key material, establishes the first
    /// session and sends the initial announcement burst.
    pub fn new(cards: Vec<C>, options: Options) -> Result<Self, LinkError> {
        options.validate()?;
        if cards.is_empty() {
            return Err(LinkError::NoCards);
        }
        let keys = match &options.keypair {
            Some(path) => KeyPair::load(path)?,
            None => KeyPair::from_seed(DEFAULT_SEED),
        };
        let card_names: Vec<String> = cards.iter().map(|c| c.name().to_string()).collect();
        info!(
            role = ?options.role,
            cards = ?card_names,
            keyed = options.keypair.is_some(),
            direction_filter = options.set_direction,
            "creating link endpoint"
        );

        let encryptor = SessionEncryptor::new(keys.clone())?;
        let decryptor = SessionDecryptor::new(keys);
        let radiotap_params = RadiotapParams::default();
        let now = Instant::now();
        let stats_window = options.stats_window();
        let tx = TxState {
            radiotap_params,
            radiotap: RadiotapTxHeader::new(&radiotap_params),
            ieee_seq: 0,
            nonce: 0,
            encryptor,
            next_announce: now + options.session_key_announce_interval(),
            stats: TxStats::default(),
            pps: PacketsPerSecond::new(stats_window),
            bitrate_excluding_overhead: Bitrate::new(stats_window),
            bitrate_including_overhead: Bitrate::new(stats_window),
        };
        let rx_cards = (0..cards.len())
            .map(|_| CardRx {
                rssi: SmoothedRssi::new(options.rtl8812au_rssi_fixup),
                nonce_tracker: NonceTracker::new(options.big_gap_threshold, stats_window),
                count_p_any: 0,
                count_p_valid: 0,
                last_valid: None,
                disconnected: false,
            })
            .collect();
        let rx = RxState {
            decryptor,
            stats: RxStats::default(),
            nonce_tracker: NonceTracker::new(options.big_gap_threshold, stats_window),
            pollution: PollutionTracker::new(options.pollution_window()),
            seq_tracker: SeqCounterTracker::new(stats_window),
            pps: PacketsPerSecond::new(stats_window),
            bitrate: Bitrate::new(stats_window),
            cards: rx_cards,
            last_delivered: None,
            last_card_select: now,
            latency_sum: Duration::ZERO,
            latency_samples: 0,
            exported_callback_panics: 0,
        };

        let shared = Arc::new(Shared {
            options,
            cards: cards.into_iter().map(Mutex::new).collect(),
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
            dispatcher: Dispatcher::new(),
            metrics: Metrics::new()?,
            curr_tx_card: AtomicUsize::new(0),
            passive: AtomicBool::new(false),
            running: AtomicBool::new(false),
            receive_thread_alive: AtomicBool::new(false),
        });

        {
            let mut tx = lock(&shared.tx);
            for i in 0..SESSION_KEY_BURST {
                shared.inject_session_frame(&mut tx, Instant::now());
                if i + 1 < SESSION_KEY_BURST {
                    thread::sleep(SESSION_KEY_BURST_SPACING);
                }
            }
            tx.next_announce = Instant::now() + shared.options.session_key_announce_interval();
        }

        Ok(Self {
            shared,
            receive_thread: None,
        })
    }

    /// Builds, protects and injects one data frame on the currently selected
    /// card, then possibly emits a session-key announcement.
    ///
    /// Hard injection failures are counted in the stats and do not fail the
    /// call; only contract violations do.
    pub fn tx_inject(&self, stream_index: u8, payload: &[u8], encrypt: bool) -> Result<(), LinkError> {
        if stream_index > STREAM_INDEX_MAX {
            return Err(LinkError::InvalidStreamIndex(stream_index));
        }
        if stream_index == 0 && encrypt {
            return Err(LinkError::ReservedPort);
        }
        if payload.len() > MAX_USER_PAYLOAD {
            return Err(LinkError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_USER_PAYLOAD,
            });
        }
        if self.shared.passive.load(Ordering::Relaxed) {
            return Err(LinkError::TransmissionsDisabled);
        }

        let now = Instant::now();
        let mut tx = lock(&self.shared.tx);
        if tx.nonce >= NONCE_ROTATE_AT {
            // The announcement of the fresh session must hit the air before
            // any data protected with it.
            tx.encryptor.rotate()?;
            tx.nonce = 0;
            self.shared.inject_session_frame(&mut tx, now);
            tx.next_announce = now + self.shared.options.session_key_announce_interval();
        }
        let nonce = tx.nonce;
        tx.nonce += 1;

        let port = RadioPort {
            stream_index,
            encrypted: encrypt,
        };
        let aad = frame_aad(port.to_byte(), nonce);
        let region = aead::protect(tx.encryptor.session_key(), nonce, &aad, payload, encrypt)?;
        let header = FrameHeader {
            role: self.shared.options.role,
            radio_port: port.to_byte(),
            nonce,
            seq_ctrl: tx.ieee_seq,
        };
        // The sequence number lives in the upper 12 bits of the field.
        tx.ieee_seq = tx.ieee_seq.wrapping_add(16);
        let frame = build_frame(&tx.radiotap, &header, &region);
        self.shared.inject_on_current_card(&mut tx, &frame);

        tx.stats.n_injected_packets += 1;
        tx.stats.n_injected_bytes_excluding_overhead += payload.len() as i64;
        tx.stats.n_injected_bytes_including_overhead += frame.len() as i64;
        tx.pps.on_packet(now);
        tx.bitrate_excluding_overhead.on_bytes(payload.len(), now);
        tx.bitrate_including_overhead.on_bytes(frame.len(), now);

        if now >= tx.next_announce {
            self.shared.inject_session_frame(&mut tx, now);
            tx.next_announce = now + self.shared.options.session_key_announce_interval();
        }
        Ok(())
    }

    /// Swaps the full radiotap parameter set. The header is constructed
    /// outside the TX lock and published atomically, so the next injected
    /// frame picks it up and no frame observes a partial update.
    pub fn tx_update_radiotap_params(&self, params: RadiotapParams) {
        let header = RadiotapTxHeader::new(&params);
        let mut tx = lock(&self.shared.tx);
        tx.radiotap_params = params;
        tx.radiotap = header;
    }

    pub fn tx_update_mcs_index(&self, mcs_index: u8) {
        let mut params = lock(&self.shared.tx).radiotap_params;
        params.mcs_index = mcs_index;
        self.tx_update_radiotap_params(params);
    }

    pub fn tx_update_channel_width(&self, width_mhz: u32) {
        let mut params = lock(&self.shared.tx).radiotap_params;
        params.channel_width_mhz = width_mhz;
        self.tx_update_radiotap_params(params);
    }

    pub fn tx_update_stbc(&self, stbc: u8) {
        let mut params = lock(&self.shared.tx).radiotap_params;
        params.stbc = stbc;
        self.tx_update_radiotap_params(params);
    }

    pub fn tx_update_guard_interval(&self, short_gi: bool) {
        let mut params = lock(&self.shared.tx).radiotap_params;
        params.short_gi = short_gi;
        self.tx_update_radiotap_params(params);
    }

    pub fn tx_update_ldpc(&self, ldpc: bool) {
        let mut params = lock(&self.shared.tx).radiotap_params;
        params.ldpc = ldpc;
        self.tx_update_radiotap_params(params);
    }

    /// Registers a per-stream handler, replacing any existing registration
    /// for the same stream index.
    pub fn rx_register_stream_handler(&self, handler: StreamRxHandler) {
        self.shared.dispatcher.register_stream_handler(handler);
    }

    pub fn rx_unregister_stream_handler(&self, stream_index: u8) {
        self.shared.dispatcher.unregister_stream_handler(stream_index);
    }

    /// Registers the callback invoked for every validated frame.
    pub fn rx_register_any_callback<F>(&self, callback: F)
    where
        F: Fn(u64, usize, u8, &[u8]) + Send + Sync + 'static,
    {
        self.shared.dispatcher.register_any_callback(callback);
    }

    /// Starts the receive thread. Receiving does not happen until this is
    /// called. Idempotent.
    pub fn start_receiving(&mut self) -> Result<(), LinkError> {
        if self.receive_thread.is_some() {
            return Ok(());
        }
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.receive_thread_alive.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("aircast-rx".into())
            .spawn(move || {
                run_receive_loop(&shared);
                shared.receive_thread_alive.store(false, Ordering::SeqCst);
            })
            .map_err(LinkError::Spawn)?;
        self.receive_thread = Some(handle);
        Ok(())
    }

    /// Stops the receive thread and joins it; the thread exits within one
    /// poll period.
    pub fn stop_receiving(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.receive_thread.take() {
            if handle.join().is_err() {
                error!("receive thread panicked during shutdown");
            }
        }
    }

    /// False once the receive thread has exited, normally or fatally.
    pub fn receive_thread_alive(&self) -> bool {
        self.shared.receive_thread_alive.load(Ordering::SeqCst)
    }

    /// Snapshot of the transmit statistics.
    pub fn get_tx_stats(&self) -> TxStats {
        let now = Instant::now();
        let mut tx = lock(&self.shared.tx);
        tx.pps.maybe_recalculate(now);
        tx.bitrate_excluding_overhead.maybe_recalculate(now);
        tx.bitrate_including_overhead.maybe_recalculate(now);
        tx.stats.curr_packets_per_second = tx.pps.current();
        tx.stats.curr_bits_per_second_excluding_overhead =
            tx.bitrate_excluding_overhead.current();
        tx.stats.curr_bits_per_second_including_overhead =
            tx.bitrate_including_overhead.current();
        tx.stats.clone()
    }

    /// Snapshot of the aggregate receive statistics.
    pub fn get_rx_stats(&self) -> RxStats {
        lock(&self.shared.rx).stats.clone()
    }

    /// Snapshot of one card's receive statistics.
    pub fn get_rx_stats_for_card(&self, card_index: usize) -> Option<RxStatsPerCard> {
        let rx = lock(&self.shared.rx);
        rx.cards.get(card_index).map(|card| RxStatsPerCard {
            rssi_dbm: card.rssi.get(),
            count_p_any: card.count_p_any,
            count_p_valid: card.count_p_valid,
            curr_packet_loss: card.nonce_tracker.loss_perc(),
            disconnected: card.disconnected,
        })
    }

    /// Clears the receive statistics; used during frequency scans.
    pub fn rx_reset_stats(&self) {
        let mut rx = lock(&self.shared.rx);
        rx.stats = RxStats::default();
        rx.nonce_tracker.reset();
        rx.pollution.reset();
        rx.seq_tracker.reset();
        rx.pps.reset();
        rx.bitrate.reset();
        for card in &mut rx.cards {
            card.count_p_any = 0;
            card.count_p_valid = 0;
            card.nonce_tracker.reset();
        }
    }

    /// Clears the transmit statistics; used by rate probing. The nonce keeps
    /// counting, it belongs to the session and not to the statistics.
    pub fn tx_reset_stats(&self) {
        let mut tx = lock(&self.shared.tx);
        tx.stats = TxStats::default();
        tx.pps.reset();
        tx.bitrate_excluding_overhead.reset();
        tx.bitrate_including_overhead.reset();
    }

    /// Index of the card currently used for injection.
    pub fn get_curr_active_tx_card(&self) -> usize {
        self.shared.curr_tx_card.load(Ordering::Relaxed)
    }

    /// In passive mode the endpoint never transmits; injection calls return
    /// [`LinkError::TransmissionsDisabled`]. Used for observer-only ground
    /// stations.
    pub fn set_passive_mode(&self, passive: bool) {
        self.shared.passive.store(passive, Ordering::Relaxed);
    }

    /// Whether the card stopped producing valid frames while others kept
    /// receiving; hints at power issues.
    pub fn get_card_has_disconnected(&self, card_index: usize) -> Option<bool> {
        let rx = lock(&self.shared.rx);
        rx.cards.get(card_index).map(|card| card.disconnected)
    }

    /// Prometheus counters for scrape-style export.
    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }
}

impl<C: MonitorIo + 'static> Drop for Endpoint<C> {
    fn drop(&mut self) {
        self.stop_receiving();
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().expect("link state mutex poisoned")
}

impl<C: MonitorIo> Shared<C> {
    fn inject_session_frame(&self, tx: &mut TxState, now: Instant) {
        if self.passive.load(Ordering::Relaxed) {
            return;
        }
        let header = FrameHeader {
            role: self.options.role,
            radio_port: SESSION_KEY_PORT,
            nonce: tx.nonce,
            seq_ctrl: tx.ieee_seq,
        };
        tx.ieee_seq = tx.ieee_seq.wrapping_add(16);
        let announcement = tx.encryptor.announcement().to_bytes();
        let frame = build_frame(&tx.radiotap, &header, &announcement);
        self.inject_on_current_card(tx, &frame);
        tx.stats.n_injected_bytes_including_overhead += frame.len() as i64;
        tx.bitrate_including_overhead.on_bytes(frame.len(), now);
    }

    fn inject_on_current_card(&self, tx: &mut TxState, frame: &[u8]) {
        let card_index = self
            .curr_tx_card
            .load(Ordering::Relaxed)
            .min(self.cards.len() - 1);
        let started = Instant::now();
        let result = lock(&self.cards[card_index]).inject(frame);
        let elapsed = started.elapsed();
        if elapsed > self.options.tx_inject_warn() {
            tx.stats.count_tx_injections_error_hint += 1;
            self.metrics.tx_slow_injections.inc();
            debug!(card_index, ?elapsed, "slow injection; driver queue may be overrunning");
        }
        match result {
            Ok(()) => self.metrics.tx_injected_frames.inc(),
            Err(err) => {
                tx.stats.count_tx_errors += 1;
                self.metrics.tx_errors.inc();
                warn!(card_index, error = %err, "frame injection failed");
            }
        }
    }
}

fn run_receive_loop<C: MonitorIo>(shared: &Shared<C>) {
    if shared.options.receive_thread_max_realtime {
        raise_thread_priority();
    }
    info!(cards = shared.cards.len(), "receive thread running");
    let mut consecutive_poll_errors = 0u32;
    let now = Instant::now();
    let mut last_error_log = now.checked_sub(RECEIVE_ERROR_LOG_INTERVAL).unwrap_or(now);

    while shared.running.load(Ordering::SeqCst) {
        match wait_for_frames(shared) {
            Ok(ready) => {
                consecutive_poll_errors = 0;
                for card_index in ready {
                    drain_card(shared, card_index, &mut last_error_log);
                }
            }
            Err(err) => {
                consecutive_poll_errors += 1;
                if last_error_log.elapsed() >= RECEIVE_ERROR_LOG_INTERVAL {
                    last_error_log = Instant::now();
                    warn!(error = %err, consecutive_poll_errors, "receive poll failed");
                }
                if consecutive_poll_errors >= MAX_CONSECUTIVE_POLL_ERRORS {
                    // Cannot poll at all; leave the endpoint degraded but
                    // observable instead of spinning.
                    error!("receive thread giving up after repeated poll failures");
                    break;
                }
            }
        }
        housekeeping(shared);
    }
    info!("receive thread exiting");
}

#[cfg(unix)]
fn wait_for_frames<C: MonitorIo>(shared: &Shared<C>) -> std::io::Result<Vec<usize>> {
    use std::os::fd::BorrowedFd;

    use nix::poll::{poll, PollFd, PollFlags};

    let mut with_fd = Vec::new();
    let mut ready = Vec::new();
    for (index, card) in shared.cards.iter().enumerate() {
        match lock(card).poll_fd() {
            Some(fd) => with_fd.push((index, fd)),
            // Descriptor-less backends are drained opportunistically.
            None => ready.push(index),
        }
    }
    if with_fd.is_empty() {
        thread::sleep(shared.options.receive_poll_timeout());
        return Ok(ready);
    }

    let mut poll_fds: Vec<PollFd> = with_fd
        .iter()
        .map(|&(_, fd)| {
            // SAFETY: the descriptor belongs to a capture handle owned by
            // `shared` and stays open for the duration of this call.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            PollFd::new(borrowed, PollFlags::POLLIN)
        })
        .collect();
    let timeout_ms = shared.options.receive_poll_timeout_ms as u16;
    match poll(&mut poll_fds, timeout_ms) {
        Ok(0) => Ok(ready),
        Ok(_) => {
            let interesting = PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP;
            for (poll_fd, &(index, _)) in poll_fds.iter().zip(with_fd.iter()) {
                if poll_fd
                    .revents()
                    .is_some_and(|revents| revents.intersects(interesting))
                {
                    ready.push(index);
                }
            }
            Ok(ready)
        }
        Err(nix::errno::Errno::EINTR) => Ok(Vec::new()),
        Err(errno) => Err(std::io::Error::from(errno)),
    }
}

#[cfg(not(unix))]
fn wait_for_frames<C: MonitorIo>(shared: &Shared<C>) -> std::io::Result<Vec<usize>> {
    thread::sleep(shared.options.receive_poll_timeout());
    Ok((0..shared.cards.len()).collect())
}

fn drain_card<C: MonitorIo>(shared: &Shared<C>, card_index: usize, last_error_log: &mut Instant) {
    let budget = shared.options.max_frames_per_poll;
    let mut polled = 0usize;
    while polled < budget {
        let next = lock(&shared.cards[card_index]).read_frame();
        match next {
            Ok(Some(frame)) => {
                polled += 1;
                process_frame(shared, card_index, frame);
            }
            Ok(None) => break,
            Err(err) => {
                if last_error_log.elapsed() >= RECEIVE_ERROR_LOG_INTERVAL {
                    *last_error_log = Instant::now();
                    warn!(card_index, error = %err, "capture read failed");
                }
                break;
            }
        }
    }
    if polled == budget {
        debug!(card_index, budget, "drained the full poll budget; CPU may be too slow");
    }
}

fn process_frame<C: MonitorIo>(shared: &Shared<C>, card_index: usize, captured: CapturedFrame) {
    let now = Instant::now();
    if shared.options.log_all_received_packets {
        debug!(card_index, len = captured.data.len(), "captured frame");
    }

    let parts = match parse_frame(shared.options.role, &captured.data) {
        Ok(parts) => parts,
        // Our own frame looped back by the driver; not counted at all.
        Err(WireError::Loopback) => return,
        Err(reason) => {
            let mut rx = lock(&shared.rx);
            rx.stats.count_p_any += 1;
            rx.stats.count_bytes_any += captured.data.len() as i64;
            rx.pollution.on_any(now);
            if let Some(card) = rx.cards.get_mut(card_index) {
                card.count_p_any += 1;
            }
            drop(rx);
            shared.metrics.rx_frames_any.inc();
            if shared.options.log_all_received_packets {
                debug!(card_index, %reason, "frame not ours");
            }
            return;
        }
    };

    let mut rx = lock(&shared.rx);
    rx.stats.count_p_any += 1;
    rx.stats.count_bytes_any += captured.data.len() as i64;
    rx.pollution.on_any(now);
    rx.seq_tracker.on_seq(parts.header.seq_ctrl >> 4, now);
    if let Some(card) = rx.cards.get_mut(card_index) {
        card.count_p_any += 1;
    }
    shared.metrics.rx_frames_any.inc();

    if shared.options.advanced_latency_debugging_rx {
        if let Ok(latency) = captured.timestamp.elapsed() {
            rx.latency_sum += latency;
            rx.latency_samples += 1;
        }
    }

    if parts.header.radio_port == SESSION_KEY_PORT {
        let announcement = match SessionAnnouncement::parse(parts.payload) {
            Ok(announcement) => announcement,
            Err(reason) => {
                debug!(card_index, %reason, "malformed session-key frame");
                return;
            }
        };
        match rx.decryptor.ingest(&announcement) {
            Ok(SessionIngest::NewSession) => {
                rx.pollution.on_ours();
                rx.seq_tracker.on_valid();
                rx.stats.n_received_valid_session_key_packets += 1;
                rx.nonce_tracker.reset();
                rx.last_delivered = None;
                for card in &mut rx.cards {
                    card.nonce_tracker.reset();
                }
                shared.metrics.rx_session_keys_accepted.inc();
                info!(card_index, "new session detected");
                drop(rx);
                // Handlers hear about the session before any of its data.
                shared.dispatcher.dispatch_new_session();
            }
            Ok(SessionIngest::SameSession) => {
                rx.pollution.on_ours();
                rx.seq_tracker.on_valid();
            }
            Err(reason) => {
                // Not fatal and the session stays as it was; just visible.
                shared.metrics.rx_session_key_failures.inc();
                debug!(card_index, %reason, "session key unwrap failed");
            }
        }
        return;
    }

    let port = RadioPort::from_byte(parts.header.radio_port);
    let nonce = parts.header.nonce;
    let Some(session_key) = rx.decryptor.session_key().cloned() else {
        // Plausibly ours, but no session yet; the sequence tracker already
        // recorded it.
        return;
    };
    let aad = frame_aad(parts.header.radio_port, nonce);
    let payload = match aead::unprotect(&session_key, nonce, &aad, parts.payload, port.encrypted) {
        Ok(payload) => payload,
        Err(_) => {
            shared.metrics.rx_aead_failures.inc();
            return;
        }
    };

    rx.pollution.on_ours();
    rx.seq_tracker.on_valid();
    if let Some(card) = rx.cards.get_mut(card_index) {
        card.count_p_valid += 1;
        card.last_valid = Some(now);
        card.nonce_tracker.on_nonce(nonce, now);
        if let Some(rssi) = parts.rx.rssi_dbm {
            card.rssi.add(rssi);
        }
    }

    // Second copy of a frame another card already delivered, or a replay.
    if rx.last_delivered.is_some_and(|last| nonce <= last) {
        return;
    }
    rx.last_delivered = Some(nonce);

    rx.stats.count_p_valid += 1;
    rx.stats.count_bytes_valid += payload.len() as i64;
    if let Some(mcs) = parts.rx.mcs_index {
        rx.stats.last_received_packet_mcs_index = i32::from(mcs);
    }
    if let Some(width) = parts.rx.channel_width_mhz {
        rx.stats.last_received_packet_channel_width = width as i32;
    }
    rx.nonce_tracker.on_nonce(nonce, now);
    rx.pps.on_packet(now);
    rx.bitrate.on_bytes(payload.len(), now);
    shared.metrics.rx_frames_valid.inc();
    if shared.options.log_all_received_validated_packets {
        debug!(card_index, nonce, stream = port.stream_index, len = payload.len(), "validated frame");
    }
    drop(rx);

    shared.dispatcher.dispatch_packet(
        nonce,
        card_index,
        parts.header.radio_port,
        port.stream_index,
        &payload,
    );
}

fn housekeeping<C: MonitorIo>(shared: &Shared<C>) {
    let now = Instant::now();
    let mut rx = lock(&shared.rx);

    rx.pps.maybe_recalculate(now);
    rx.bitrate.maybe_recalculate(now);
    rx.seq_tracker.maybe_recalculate(now);
    rx.nonce_tracker.maybe_recalculate(now);
    rx.pollution.maybe_recalculate(now);
    for card in &mut rx.cards {
        card.nonce_tracker.maybe_recalculate(now);
    }
    rx.stats.curr_packets_per_second = rx.pps.current();
    rx.stats.curr_bits_per_second = rx.bitrate.current();
    rx.stats.curr_packet_loss = rx.nonce_tracker.loss_perc();
    rx.stats.curr_big_gaps_counter = rx.nonce_tracker.big_gaps();
    rx.stats.curr_link_pollution_perc = rx.pollution.pollution_perc();
    rx.stats.curr_n_likely_link_packets = rx.seq_tracker.likely_not_valid();

    let panics = shared.dispatcher.callback_panics();
    if panics > rx.exported_callback_panics {
        shared
            .metrics
            .callback_panics
            .inc_by(panics - rx.exported_callback_panics);
        rx.exported_callback_panics = panics;
    }

    if now.duration_since(rx.last_card_select) < CARD_SELECT_INTERVAL {
        return;
    }
    rx.last_card_select = now;

    let timeout = shared.options.card_disconnect_timeout();
    let recent: Vec<bool> = rx
        .cards
        .iter()
        .map(|card| {
            card.last_valid
                .is_some_and(|at| now.duration_since(at) < timeout)
        })
        .collect();
    let any_recent = recent.iter().any(|&flag| flag);
    for (card, &is_recent) in rx.cards.iter_mut().zip(recent.iter()) {
        let disconnected = any_recent && !is_recent;
        if disconnected && !card.disconnected {
            warn!("card stopped receiving while others still do");
        }
        card.disconnected = disconnected;
    }

    if shared.options.enable_auto_switch_tx_card {
        let mut best: Option<(usize, i8)> = None;
        for (index, card) in rx.cards.iter().enumerate() {
            if card.disconnected {
                continue;
            }
            if let Some(rssi) = card.rssi.get() {
                if best.map_or(true, |(_, current)| rssi > current) {
                    best = Some((index, rssi));
                }
            }
        }
        if let Some((index, rssi)) = best {
            let previous = shared.curr_tx_card.swap(index, Ordering::Relaxed);
            if previous != index {
                info!(from = previous, to = index, rssi, "switching TX card");
            }
        }
    }

    if shared.options.advanced_latency_debugging_rx && rx.latency_samples > 0 {
        let avg = rx.latency_sum / rx.latency_samples as u32;
        debug!(samples = rx.latency_samples, ?avg, "capture-to-process latency");
        rx.latency_sum = Duration::ZERO;
        rx.latency_samples = 0;
    }
}

#[cfg(target_os = "linux")]
fn raise_thread_priority() {
    // SAFETY: plain libc calls acting on the current thread with a valid
    // sched_param.
    unsafe {
        let priority = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if priority < 0 {
            warn!("querying SCHED_FIFO priority range failed");
            return;
        }
        let param = libc::sched_param {
            sched_priority: priority,
        };
        let rc = libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param);
        if rc != 0 {
            warn!(rc, "setting realtime priority failed; running without");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn raise_thread_priority() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aead::protect;
    use crate::crypto::session::SessionEncryptor;
    use crate::wire::{self, Role};
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU64;
    use std::sync::mpsc;
    use std::time::SystemTime;

    type DropFilter = Box<dyn Fn(&[u8]) -> bool + Send>;
    type Corruptor = Box<dyn Fn(&mut Vec<u8>) + Send>;

    #[derive(Default)]
    struct BusInner {
        queues: Vec<(u8, VecDeque<CapturedFrame>)>,
        drop_filter: Option<DropFilter>,
        corruptor: Option<Corruptor>,
        dead_slots: Vec<usize>,
    }

    /// Broadcast medium: frames injected by one endpoint appear in the
    /// queues of every card belonging to a different endpoint.
    #[derive(Clone, Default)]
    struct Bus(Arc<Mutex<BusInner>>);

    impl Bus {
        fn card(&self, endpoint: u8, name: &str) -> TestCard {
            let mut inner = self.0.lock().unwrap();
            inner.queues.push((endpoint, VecDeque::new()));
            TestCard {
                bus: self.clone(),
                endpoint,
                slot: inner.queues.len() - 1,
                name: name.to_string(),
                injected: Arc::new(AtomicU64::new(0)),
            }
        }

        fn set_drop_filter(&self, filter: impl Fn(&[u8]) -> bool + Send + 'static) {
            self.0.lock().unwrap().drop_filter = Some(Box::new(filter));
        }

        fn set_corruptor(&self, corruptor: impl Fn(&mut Vec<u8>) + Send + 'static) {
            self.0.lock().unwrap().corruptor = Some(Box::new(corruptor));
        }

        fn kill_slot(&self, slot: usize) {
            self.0.lock().unwrap().dead_slots.push(slot);
        }

        fn push_to_slot(&self, slot: usize, frame: Vec<u8>) {
            let mut inner = self.0.lock().unwrap();
            inner.queues[slot].1.push_back(CapturedFrame {
                timestamp: SystemTime::now(),
                data: Bytes::from(frame),
            });
        }
    }

    struct TestCard {
        bus: Bus,
        endpoint: u8,
        slot: usize,
        name: String,
        injected: Arc<AtomicU64>,
    }

    impl MonitorIo for TestCard {
        type Error = std::convert::Infallible;

        fn name(&self) -> &str {
            &self.name
        }

        fn poll_fd(&self) -> Option<std::os::raw::c_int> {
            None
        }

        fn read_frame(&mut self) -> Result<Option<CapturedFrame>, Self::Error> {
            Ok(self.bus.0.lock().unwrap().queues[self.slot].1.pop_front())
        }

        fn inject(&mut self, frame: &[u8]) -> Result<(), Self::Error> {
            self.injected.fetch_add(1, Ordering::SeqCst);
            let mut inner = self.bus.0.lock().unwrap();
            let BusInner {
                queues,
                drop_filter,
                corruptor,
                dead_slots,
            } = &mut *inner;
            if drop_filter.as_ref().is_some_and(|f| f(frame)) {
                return Ok(());
            }
            let mut bytes = frame.to_vec();
            if let Some(corrupt) = corruptor {
                corrupt(&mut bytes);
            }
            let captured = CapturedFrame {
                timestamp: SystemTime::now(),
                data: Bytes::from(bytes),
            };
            for (slot, (endpoint, queue)) in queues.iter_mut().enumerate() {
                if *endpoint != self.endpoint && !dead_slots.contains(&slot) {
                    queue.push_back(captured.clone());
                }
            }
            Ok(())
        }
    }

    fn test_options(role: Role) -> Options {
        Options {
            role,
            receive_thread_max_realtime: false,
            session_key_announce_interval_ms: 100,
            stats_window_ms: 100,
            pollution_window_ms: 100,
            receive_poll_timeout_ms: 2,
            card_disconnect_timeout_ms: 300,
            ..Options::default()
        }
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn loopback_delivers_encrypted_payload() {
        let bus = Bus::default();
        let ground_card = bus.card(2, "gnd0");
        let air_card = bus.card(1, "air0");
        let mut ground = Endpoint::new(vec![ground_card], test_options(Role::Ground)).unwrap();
        let air = Endpoint::new(vec![air_card], test_options(Role::Air)).unwrap();

        let (sender, receiver) = mpsc::channel();
        ground.rx_register_stream_handler(StreamRxHandler::new(
            7,
            move |nonce, card_index, payload| {
                sender.send((nonce, card_index, payload.to_vec())).ok();
            },
            || {},
        ));
        ground.start_receiving().unwrap();

        air.tx_inject(7, b"hello", true).unwrap();

        let (nonce, card_index, payload) = receiver
            .recv_timeout(Duration::from_secs(2))
            .expect("delivery");
        assert_eq!(payload, b"hello");
        assert_eq!(nonce, 0);
        assert_eq!(card_index, 0);
    }

    #[test]
    fn any_callback_sees_port_byte() {
        let bus = Bus::default();
        let mut ground = Endpoint::new(vec![bus.card(2, "gnd0")], test_options(Role::Ground)).unwrap();
        let air = Endpoint::new(vec![bus.card(1, "air0")], test_options(Role::Air)).unwrap();

        let (sender, receiver) = mpsc::channel();
        ground.rx_register_any_callback(move |nonce, _card, port, payload| {
            sender.send((nonce, port, payload.to_vec())).ok();
        });
        ground.start_receiving().unwrap();

        air.tx_inject(5, b"plain", false).unwrap();
        let (nonce, port, payload) = receiver
            .recv_timeout(Duration::from_secs(2))
            .expect("delivery");
        assert_eq!(nonce, 0);
        assert_eq!(
            RadioPort::from_byte(port),
            RadioPort {
                stream_index: 5,
                encrypted: false
            }
        );
        assert_eq!(payload, b"plain");
    }

    #[test]
    fn multi_stream_delivery_keeps_per_stream_order() {
        let bus = Bus::default();
        let mut ground = Endpoint::new(vec![bus.card(2, "gnd0")], test_options(Role::Ground)).unwrap();
        let air = Endpoint::new(vec![bus.card(1, "air0")], test_options(Role::Air)).unwrap();

        let log = Arc::new(Mutex::new(Vec::<(u8, Vec<u8>)>::new()));
        for stream in [1u8, 2] {
            let log = Arc::clone(&log);
            ground.rx_register_stream_handler(StreamRxHandler::new(
                stream,
                move |_, _, payload| {
                    log.lock().unwrap().push((stream, payload.to_vec()));
                },
                || {},
            ));
        }
        ground.start_receiving().unwrap();

        air.tx_inject(1, b"a", false).unwrap();
        air.tx_inject(2, b"b", false).unwrap();
        air.tx_inject(1, b"c", false).unwrap();

        assert!(wait_until(Duration::from_secs(2), || log
            .lock()
            .unwrap()
            .len()
            == 3));
        let log = log.lock().unwrap();
        let stream1: Vec<_> = log.iter().filter(|(s, _)| *s == 1).map(|(_, p)| p.clone()).collect();
        let stream2: Vec<_> = log.iter().filter(|(s, _)| *s == 2).map(|(_, p)| p.clone()).collect();
        assert_eq!(stream1, vec![b"a".to_vec(), b"c".to_vec()]);
        assert_eq!(stream2, vec![b"b".to_vec()]);
    }

    #[test]
    fn session_rotation_notifies_before_next_data() {
        #[derive(Debug, PartialEq, Clone)]
        enum Event {
            Session,
            Data(Vec<u8>),
        }

        let bus = Bus::default();
        let mut ground = Endpoint::new(vec![bus.card(2, "gnd0")], test_options(Role::Ground)).unwrap();

        let events = Arc::new(Mutex::new(Vec::<Event>::new()));
        let data_events = Arc::clone(&events);
        let session_events = Arc::clone(&events);
        ground.rx_register_stream_handler(StreamRxHandler::new(
            3,
            move |_, _, payload| {
                data_events.lock().unwrap().push(Event::Data(payload.to_vec()));
            },
            move || {
                session_events.lock().unwrap().push(Event::Session);
            },
        ));
        ground.start_receiving().unwrap();

        let air1 = Endpoint::new(vec![bus.card(1, "air0")], test_options(Role::Air)).unwrap();
        air1.tx_inject(3, b"one", false).unwrap();
        assert!(wait_until(Duration::from_secs(2), || events
            .lock()
            .unwrap()
            .contains(&Event::Data(b"one".to_vec()))));
        drop(air1);

        // A restarted air unit announces a fresh session key.
        let air2 = Endpoint::new(vec![bus.card(1, "air1")], test_options(Role::Air)).unwrap();
        air2.tx_inject(3, b"two", false).unwrap();
        assert!(wait_until(Duration::from_secs(2), || events
            .lock()
            .unwrap()
            .contains(&Event::Data(b"two".to_vec()))));

        let events = events.lock().unwrap();
        let sessions = events.iter().filter(|e| **e == Event::Session).count();
        assert_eq!(sessions, 2, "one per air unit: {events:?}");
        let one = events.iter().position(|e| *e == Event::Data(b"one".to_vec())).unwrap();
        let two = events.iter().position(|e| *e == Event::Data(b"two".to_vec())).unwrap();
        let second_session = events.iter().rposition(|e| *e == Event::Session).unwrap();
        assert!(events[0] == Event::Session, "session precedes first data");
        assert!(one < second_session && second_session < two);
    }

    #[test]
    fn tampered_frame_counts_any_but_not_valid() {
        let bus = Bus::default();
        let mut ground = Endpoint::new(vec![bus.card(2, "gnd0")], test_options(Role::Ground)).unwrap();
        let air = Endpoint::new(vec![bus.card(1, "air0")], test_options(Role::Air)).unwrap();

        let (sender, receiver) = mpsc::channel();
        ground.rx_register_stream_handler(StreamRxHandler::new(
            7,
            move |_, _, payload| {
                sender.send(payload.to_vec()).ok();
            },
            || {},
        ));
        ground.start_receiving().unwrap();

        // Flip one ciphertext byte of data frames only; session-key frames
        // are longer and pass untouched.
        let data_frame_len =
            wire::RADIOTAP_TX_HEADER_LEN + wire::IEEE80211_HEADER_LEN + b"hello".len() + 16;
        bus.set_corruptor(move |frame| {
            if frame.len() == data_frame_len {
                let last = frame.len() - 1;
                frame[last] ^= 0x01;
            }
        });

        air.tx_inject(7, b"hello", true).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            ground.get_rx_stats().count_p_any > 0 && ground.metrics().rx_aead_failures.get() == 1
        }));
        assert_eq!(ground.get_rx_stats().count_p_valid, 0);
        assert!(receiver.try_recv().is_err(), "no delivery for tampered frame");
    }

    #[test]
    fn replayed_frame_is_not_delivered_twice() {
        let bus = Bus::default();
        let mut ground = Endpoint::new(vec![bus.card(2, "gnd0")], test_options(Role::Ground)).unwrap();
        let ground_slot = 0usize;
        let air = Endpoint::new(vec![bus.card(1, "air0")], test_options(Role::Air)).unwrap();

        let deliveries = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&deliveries);
        ground.rx_register_stream_handler(StreamRxHandler::new(
            4,
            move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            || {},
        ));
        ground.start_receiving().unwrap();

        air.tx_inject(4, b"once", false).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            deliveries.load(Ordering::SeqCst) == 1
        }));

        // Replay the exact captured frame.
        let replay = {
            let tx = lock(&air.shared.tx);
            let port = RadioPort {
                stream_index: 4,
                encrypted: false,
            };
            let aad = frame_aad(port.to_byte(), 0);
            let region = protect(tx.encryptor.session_key(), 0, &aad, b"once", false).unwrap();
            let header = FrameHeader {
                role: Role::Air,
                radio_port: port.to_byte(),
                nonce: 0,
                seq_ctrl: 0,
            };
            build_frame(&tx.radiotap, &header, &region)
        };
        bus.push_to_slot(ground_slot, replay);

        thread::sleep(Duration::from_millis(200));
        assert_eq!(deliveries.load(Ordering::SeqCst), 1, "replay must not deliver");
    }

    #[test]
    fn steady_loss_is_reported_within_a_window() {
        let bus = Bus::default();
        let mut ground = Endpoint::new(vec![bus.card(2, "gnd0")], test_options(Role::Ground)).unwrap();
        let air = Endpoint::new(vec![bus.card(1, "air0")], test_options(Role::Air)).unwrap();
        ground.start_receiving().unwrap();

        bus.set_drop_filter(|frame| {
            parse_frame(Role::Ground, frame)
                .ok()
                .filter(|parts| parts.header.radio_port != SESSION_KEY_PORT)
                .is_some_and(|parts| (10..20).contains(&parts.header.nonce))
        });

        for i in 0..100u8 {
            air.tx_inject(1, &[i], false).unwrap();
        }

        assert!(wait_until(Duration::from_secs(2), || {
            ground.get_rx_stats().count_p_valid == 90
        }));
        assert!(
            wait_until(Duration::from_secs(2), || {
                (8..=12).contains(&ground.get_rx_stats().curr_packet_loss)
            }),
            "expected ~10% loss, got {}",
            ground.get_rx_stats().curr_packet_loss
        );
    }

    #[test]
    fn passive_mode_produces_no_traffic() {
        let bus = Bus::default();
        let mut ground = Endpoint::new(vec![bus.card(2, "gnd0")], test_options(Role::Ground)).unwrap();
        let air_card = bus.card(1, "air0");
        let injected = Arc::clone(&air_card.injected);
        let air = Endpoint::new(vec![air_card], test_options(Role::Air)).unwrap();
        ground.start_receiving().unwrap();

        air.set_passive_mode(true);
        let injected_before = injected.load(Ordering::SeqCst);
        let tx_before = air.get_tx_stats();

        let err = air.tx_inject(1, b"x", false).unwrap_err();
        assert!(matches!(err, LinkError::TransmissionsDisabled));

        thread::sleep(Duration::from_millis(200));
        assert_eq!(injected.load(Ordering::SeqCst), injected_before);
        let tx_after = air.get_tx_stats();
        assert_eq!(tx_after.n_injected_packets, tx_before.n_injected_packets);
        assert_eq!(
            tx_after.n_injected_bytes_including_overhead,
            tx_before.n_injected_bytes_including_overhead
        );
    }

    #[test]
    fn idle_transmitter_stays_quiet_after_burst() {
        let bus = Bus::default();
        let _ground_card = bus.card(2, "gnd0");
        let air_card = bus.card(1, "air0");
        let injected = Arc::clone(&air_card.injected);
        let _air = Endpoint::new(vec![air_card], test_options(Role::Air)).unwrap();

        assert_eq!(injected.load(Ordering::SeqCst), SESSION_KEY_BURST as u64);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(
            injected.load(Ordering::SeqCst),
            SESSION_KEY_BURST as u64,
            "no announcements without data"
        );
    }

    #[test]
    fn continuous_producer_announces_at_interval() {
        let bus = Bus::default();
        let _ground_card = bus.card(2, "gnd0");
        let air_card = bus.card(1, "air0");
        let injected = Arc::clone(&air_card.injected);
        let air = Endpoint::new(vec![air_card], test_options(Role::Air)).unwrap();

        // ~500 ms of continuous data with a 100 ms announce interval.
        let mut data_frames = 0u64;
        for _ in 0..50 {
            air.tx_inject(1, b"tick", false).unwrap();
            data_frames += 1;
            thread::sleep(Duration::from_millis(10));
        }
        let announcements =
            injected.load(Ordering::SeqCst) - data_frames - SESSION_KEY_BURST as u64;
        assert!(
            (2..=9).contains(&announcements),
            "expected ~5 announcements, got {announcements}"
        );
    }

    #[test]
    fn boundary_stream_and_payload_sizes() {
        let bus = Bus::default();
        let _ground_card = bus.card(2, "gnd0");
        let air = Endpoint::new(vec![bus.card(1, "air0")], test_options(Role::Air)).unwrap();

        assert!(matches!(
            air.tx_inject(128, b"x", false).unwrap_err(),
            LinkError::InvalidStreamIndex(128)
        ));
        assert!(matches!(
            air.tx_inject(0, b"x", true).unwrap_err(),
            LinkError::ReservedPort
        ));
        let oversized = vec![0u8; MAX_USER_PAYLOAD + 1];
        assert!(matches!(
            air.tx_inject(1, &oversized, false).unwrap_err(),
            LinkError::PayloadTooLarge { .. }
        ));
        let max = vec![0u8; MAX_USER_PAYLOAD];
        air.tx_inject(1, &max, false).expect("max payload fits");
        air.tx_inject(0, b"x", false).expect("plain stream 0 is fine");
    }

    #[test]
    fn concurrent_producers_never_cross_streams() {
        let bus = Bus::default();
        let mut ground = Endpoint::new(vec![bus.card(2, "gnd0")], test_options(Role::Ground)).unwrap();
        let air =
            Arc::new(Endpoint::new(vec![bus.card(1, "air0")], test_options(Role::Air)).unwrap());

        let received = Arc::new(Mutex::new(Vec::<(u8, Vec<u8>)>::new()));
        for stream in [5u8, 6] {
            let received = Arc::clone(&received);
            ground.rx_register_stream_handler(StreamRxHandler::new(
                stream,
                move |_, _, payload| {
                    received.lock().unwrap().push((stream, payload.to_vec()));
                },
                || {},
            ));
        }
        ground.start_receiving().unwrap();

        let workers: Vec<_> = [5u8, 6]
            .into_iter()
            .map(|stream| {
                let air = Arc::clone(&air);
                thread::spawn(move || {
                    for _ in 0..20 {
                        air.tx_inject(stream, &[stream], false).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(wait_until(Duration::from_secs(2), || received
            .lock()
            .unwrap()
            .len()
            == 40));
        for (stream, payload) in received.lock().unwrap().iter() {
            assert_eq!(payload, &vec![*stream], "stream {stream} got foreign payload");
        }
    }

    #[test]
    fn delivered_nonces_strictly_increase() {
        let bus = Bus::default();
        let mut ground = Endpoint::new(vec![bus.card(2, "gnd0")], test_options(Role::Ground)).unwrap();
        let air = Endpoint::new(vec![bus.card(1, "air0")], test_options(Role::Air)).unwrap();

        let nonces = Arc::new(Mutex::new(Vec::<u64>::new()));
        let sink = Arc::clone(&nonces);
        ground.rx_register_any_callback(move |nonce, _, _, _| {
            sink.lock().unwrap().push(nonce);
        });
        ground.start_receiving().unwrap();

        for i in 0..50u8 {
            air.tx_inject(2, &[i], (i % 2) == 0 && i != 0).unwrap();
        }
        assert!(wait_until(Duration::from_secs(2), || nonces
            .lock()
            .unwrap()
            .len()
            == 50));
        let nonces = nonces.lock().unwrap();
        assert!(nonces.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn radiotap_update_applies_to_next_frame() {
        let bus = Bus::default();
        let mut ground = Endpoint::new(vec![bus.card(2, "gnd0")], test_options(Role::Ground)).unwrap();
        let air = Endpoint::new(vec![bus.card(1, "air0")], test_options(Role::Air)).unwrap();
        ground.start_receiving().unwrap();

        air.tx_update_mcs_index(9);
        air.tx_update_channel_width(40);
        air.tx_inject(1, b"tuned", false).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            let stats = ground.get_rx_stats();
            stats.last_received_packet_mcs_index == 9
                && stats.last_received_packet_channel_width == 40
        }));
    }

    #[test]
    fn starved_card_is_flagged_disconnected() {
        let bus = Bus::default();
        let card_a = bus.card(2, "gnd0");
        let card_b = bus.card(2, "gnd1");
        let starved_slot = card_b.slot;
        let mut ground =
            Endpoint::new(vec![card_a, card_b], test_options(Role::Ground)).unwrap();
        let air = Endpoint::new(vec![bus.card(1, "air0")], test_options(Role::Air)).unwrap();
        ground.start_receiving().unwrap();

        // Both cards healthy first.
        for i in 0..10u8 {
            air.tx_inject(1, &[i], false).unwrap();
        }
        assert!(wait_until(Duration::from_secs(2), || {
            ground
                .get_rx_stats_for_card(1)
                .is_some_and(|stats| stats.count_p_valid > 0)
        }));

        bus.kill_slot(starved_slot);
        assert!(wait_until(Duration::from_secs(5), || {
            for i in 0..30u8 {
                air.tx_inject(1, &[i], false).unwrap();
            }
            ground.get_card_has_disconnected(1) == Some(true)
        }));
        assert_eq!(ground.get_card_has_disconnected(0), Some(false));
    }

    #[test]
    fn tx_card_follows_strongest_rssi() {
        let bus = Bus::default();
        let card_a = bus.card(2, "gnd0");
        let card_b = bus.card(2, "gnd1");
        let (slot_a, slot_b) = (card_a.slot, card_b.slot);
        let mut ground =
            Endpoint::new(vec![card_a, card_b], test_options(Role::Ground)).unwrap();
        ground.start_receiving().unwrap();

        let encryptor = SessionEncryptor::new(KeyPair::from_seed(DEFAULT_SEED)).unwrap();
        let announce_header = FrameHeader {
            role: Role::Air,
            radio_port: SESSION_KEY_PORT,
            nonce: 0,
            seq_ctrl: 0,
        };
        let announcement = encryptor.announcement().to_bytes();
        bus.push_to_slot(slot_a, frame_with_rssi(-80, &announce_header, &announcement));
        bus.push_to_slot(slot_b, frame_with_rssi(-40, &announce_header, &announcement));

        for nonce in 0..30u64 {
            let port = RadioPort {
                stream_index: 1,
                encrypted: false,
            };
            let aad = frame_aad(port.to_byte(), nonce);
            let region = protect(encryptor.session_key(), nonce, &aad, b"s", false).unwrap();
            let header = FrameHeader {
                role: Role::Air,
                radio_port: port.to_byte(),
                nonce,
                seq_ctrl: 0,
            };
            bus.push_to_slot(slot_a, frame_with_rssi(-80, &header, &region));
            bus.push_to_slot(slot_b, frame_with_rssi(-40, &header, &region));
        }

        // Selection runs on a 1 Hz cadence.
        assert!(
            wait_until(Duration::from_secs(3), || ground.get_curr_active_tx_card() == 1),
            "expected the stronger card to be selected"
        );
    }

    fn frame_with_rssi(rssi: i8, header: &FrameHeader, payload: &[u8]) -> Vec<u8> {
        // Minimal radiotap: fixed header + one DBM_ANTSIGNAL field.
        let mut frame = vec![0u8, 0, 9, 0];
        frame.extend_from_slice(&(1u32 << 5).to_le_bytes());
        frame.push(rssi as u8);
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn rx_reset_clears_counters_but_keeps_session() {
        let bus = Bus::default();
        let mut ground = Endpoint::new(vec![bus.card(2, "gnd0")], test_options(Role::Ground)).unwrap();
        let air = Endpoint::new(vec![bus.card(1, "air0")], test_options(Role::Air)).unwrap();

        let deliveries = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&deliveries);
        ground.rx_register_stream_handler(StreamRxHandler::new(
            1,
            move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            || {},
        ));
        ground.start_receiving().unwrap();

        air.tx_inject(1, b"before", false).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            ground.get_rx_stats().count_p_valid == 1
        }));

        ground.rx_reset_stats();
        assert_eq!(ground.get_rx_stats().count_p_valid, 0);

        // The installed session survives a stats reset.
        air.tx_inject(1, b"after", false).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            deliveries.load(Ordering::SeqCst) == 2
        }));
    }

    #[test]
    fn stop_receiving_joins_within_poll_period() {
        let bus = Bus::default();
        let mut ground = Endpoint::new(vec![bus.card(2, "gnd0")], test_options(Role::Ground)).unwrap();
        ground.start_receiving().unwrap();
        assert!(ground.receive_thread_alive());
        let started = Instant::now();
        ground.stop_receiving();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!ground.receive_thread_alive());
    }
}
