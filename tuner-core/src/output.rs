//! # Output Pipeline Module
//!
//! Streams the playback buffer to the analog output without gaps.
//!
//! A sample-rate timer paces a [`TransferEngine`], which moves one sample per period
//! from the armed buffer to the output. When a transfer finishes, the completion
//! interrupt runs [`CompletionHandler::on_transfer_complete`] and points the engine
//! back at a buffer. The interrupt does a fixed amount of work and never blocks.
//!
//! ## Buffer ownership
//! Playback memory is a [`PlaybackArena`] of two slots. One atomic state word records
//! the *published* slot, which the next reload picks up, and the *in-flight* slot,
//! which the engine is reading now. A rewrite:
//!
//! 1. claims the slot that is not in flight and, in the same atomic step, publishes
//!    the in-flight slot, so a reload in the meantime keeps replaying current audio;
//! 2. writes the claimed slot;
//! 3. publishes the claimed slot.
//!
//! The interrupt only ever makes the published slot the in-flight one. So the slot
//! being written is never in flight, and the engine never reads a half-written
//! buffer, whatever the interleaving.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::error::OutputError;

const SLOT_COUNT: usize = 2;
const PUBLISHED_BIT: u8 = 0b01;
const IN_FLIGHT_SHIFT: u8 = 1;

/// Identifies one of the two playback slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u8);

impl SlotId {
    pub const FIRST: SlotId = SlotId(0);
    pub const SECOND: SlotId = SlotId(1);

    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    pub fn other(self) -> SlotId {
        SlotId(self.0 ^ 1)
    }
}

fn published(state: u8) -> u8 {
    state & PUBLISHED_BIT
}

fn in_flight(state: u8) -> u8 {
    (state >> IN_FLIGHT_SHIFT) & 1
}

fn pack(published: u8, in_flight: u8) -> u8 {
    (in_flight << IN_FLIGHT_SHIFT) | published
}

/// A programmed transfer: source slot, number of samples, and whether completion
/// raises the reload interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub source: SlotId,
    pub length: usize,
    pub auto_reload: bool,
}

/// Streaming transfer engine capability.
pub trait TransferEngine {
    /// Binds source and length. Leaves the engine disabled until [`start`](Self::start).
    fn configure(&mut self, transfer: Transfer);

    fn start(&mut self);
}

/// Timer that paces the transfer engine at the output sample rate.
pub trait SampleRateTimer {
    type Error;

    fn configure(&mut self, period: Duration);

    fn start(&mut self) -> Result<(), Self::Error>;
}

/// Two fixed-capacity playback slots with lock-free slot selection.
#[derive(Debug)]
pub struct PlaybackArena {
    slots: [Mutex<Box<[i16]>>; SLOT_COUNT],
    lengths: [AtomicUsize; SLOT_COUNT],
    state: AtomicU8,
    capacity: usize,
}

impl PlaybackArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: [
                Mutex::new(vec![0; capacity].into_boxed_slice()),
                Mutex::new(vec![0; capacity].into_boxed_slice()),
            ],
            lengths: [AtomicUsize::new(0), AtomicUsize::new(0)],
            state: AtomicU8::new(pack(0, 0)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn published_slot(&self) -> SlotId {
        SlotId(published(self.state.load(Ordering::Acquire)))
    }

    pub fn in_flight_slot(&self) -> SlotId {
        SlotId(in_flight(self.state.load(Ordering::Acquire)))
    }

    /// Claims the slot that is not in flight for rewriting (main loop side).
    pub fn begin_write(&self) -> SlotWriter<'_> {
        let prev = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                let current = in_flight(s);
                Some(pack(current, current))
            })
            .unwrap_or_else(|s| s);
        let slot = SlotId(in_flight(prev)).other();
        SlotWriter {
            arena: self,
            slot,
            guard: self.slots[slot.index()].lock(),
        }
    }

    /// Makes the published slot the in-flight one and returns the transfer to
    /// program (interrupt side). `None` until something has been published.
    pub fn adopt_published(&self) -> Option<Transfer> {
        let prev = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                let next = published(s);
                Some(pack(next, next))
            })
            .unwrap_or_else(|s| s);
        let source = SlotId(published(prev));
        let length = self.lengths[source.index()].load(Ordering::Acquire);
        (length > 0).then_some(Transfer {
            source,
            length,
            auto_reload: true,
        })
    }

    /// Non-blocking access for the engine. `None` means the slot is being written,
    /// which the slot protocol rules out for the in-flight slot.
    pub fn try_read(&self, slot: SlotId) -> Option<MutexGuard<'_, Box<[i16]>>> {
        self.slots[slot.index()].try_lock()
    }
}

/// Exclusive write access to a claimed, unpublished slot.
pub struct SlotWriter<'a> {
    arena: &'a PlaybackArena,
    slot: SlotId,
    guard: MutexGuard<'a, Box<[i16]>>,
}

impl SlotWriter<'_> {
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn samples_mut(&mut self) -> &mut [i16] {
        &mut self.guard
    }

    /// Publishes the slot with a transfer length of `length` samples.
    ///
    /// On error the slot stays unpublished and the in-flight audio keeps playing.
    pub fn commit(self, length: usize) -> Result<SlotId, OutputError> {
        let SlotWriter { arena, slot, guard } = self;
        if length == 0 {
            return Err(OutputError::EmptyTransfer);
        }
        if length > arena.capacity {
            return Err(OutputError::CapacityExceeded {
                length,
                capacity: arena.capacity,
            });
        }
        arena.lengths[slot.index()].store(length, Ordering::Release);
        drop(guard);
        let _ = arena
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                Some(pack(slot.0, in_flight(s)))
            });
        Ok(slot)
    }
}

/// Lifecycle of the output pipeline. There is no stop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Engine configured, nothing armed
    Idle,
    /// A buffer is published, transfer not started
    Armed,
    /// Transfer running and reloading itself on completion
    Streaming,
}

/// Main-loop side of the output pipeline.
#[derive(Debug)]
pub struct OutputPipeline {
    arena: Arc<PlaybackArena>,
    state: PipelineState,
}

impl OutputPipeline {
    pub fn new(capacity: usize) -> Self {
        Self {
            arena: Arc::new(PlaybackArena::new(capacity)),
            state: PipelineState::Idle,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn arena(&self) -> &Arc<PlaybackArena> {
        &self.arena
    }

    /// Handle for the completion interrupt.
    pub fn completion_handler(&self) -> CompletionHandler {
        CompletionHandler {
            arena: Arc::clone(&self.arena),
        }
    }

    /// Rewrites the idle slot with `fill`, which returns the transfer length, and
    /// publishes it.
    ///
    /// Arms an idle pipeline. While streaming, the new buffer is picked up by the next
    /// completion reload.
    pub fn load<F>(&mut self, fill: F) -> Result<SlotId, OutputError>
    where
        F: FnOnce(&mut [i16]) -> usize,
    {
        let mut writer = self.arena.begin_write();
        let length = fill(writer.samples_mut());
        let slot = writer.commit(length)?;
        if self.state == PipelineState::Idle {
            self.state = PipelineState::Armed;
        }
        log::debug!("[OUTPUT] published slot {} ({} samples)", slot.index(), length);
        Ok(slot)
    }

    /// Programs the engine with the armed buffer and enables it.
    pub fn start<E>(&mut self, engine: &mut E) -> Result<Transfer, OutputError>
    where
        E: TransferEngine + ?Sized,
    {
        match self.state {
            PipelineState::Idle => Err(OutputError::NotArmed),
            PipelineState::Streaming => Err(OutputError::AlreadyStreaming),
            PipelineState::Armed => {
                let transfer = self.arena.adopt_published().ok_or(OutputError::NotArmed)?;
                engine.configure(transfer);
                engine.start();
                self.state = PipelineState::Streaming;
                log::info!(
                    "[OUTPUT] streaming slot {} ({} samples per transfer)",
                    transfer.source.index(),
                    transfer.length
                );
                Ok(transfer)
            }
        }
    }
}

/// Completion interrupt body. Cloneable so it can move into an interrupt context.
#[derive(Debug, Clone)]
pub struct CompletionHandler {
    arena: Arc<PlaybackArena>,
}

impl CompletionHandler {
    /// Re-programs `engine` with the published slot and re-enables it.
    pub fn on_transfer_complete<E>(&self, engine: &mut E)
    where
        E: TransferEngine + ?Sized,
    {
        if let Some(transfer) = self.arena.adopt_published() {
            engine.configure(transfer);
            engine.start();
        }
    }
}

/// One cadence step of a [`StreamEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStep {
    pub sample: i16,
    /// The transfer ran out on this step and the completion interrupt is pending
    pub completed: bool,
}

/// Software transfer engine: moves one sample from the bound slot per timer period.
#[derive(Debug)]
pub struct StreamEngine {
    arena: Arc<PlaybackArena>,
    transfer: Option<Transfer>,
    cursor: usize,
    enabled: bool,
    transferred: u64,
    torn_reads: u64,
}

impl StreamEngine {
    pub fn new(arena: Arc<PlaybackArena>) -> Self {
        Self {
            arena,
            transfer: None,
            cursor: 0,
            enabled: false,
            transferred: 0,
            torn_reads: 0,
        }
    }

    pub fn transfer(&self) -> Option<Transfer> {
        self.transfer
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Total samples moved since creation.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Reads that found the source slot locked by a writer. Always zero when the slot
    /// protocol holds.
    pub fn torn_reads(&self) -> u64 {
        self.torn_reads
    }

    /// Moves one sample. `None` while disabled.
    pub fn step(&mut self) -> Option<EngineStep> {
        if !self.enabled {
            return None;
        }
        let transfer = self.transfer?;
        let sample = match self.arena.try_read(transfer.source) {
            Some(slot) => slot[self.cursor],
            None => {
                self.torn_reads += 1;
                0
            }
        };
        self.cursor += 1;
        self.transferred += 1;

        let completed = self.cursor >= transfer.length;
        if completed {
            self.enabled = false;
        }
        Some(EngineStep {
            sample,
            completed: completed && transfer.auto_reload,
        })
    }

    /// Moves one sample and, if the transfer finished, runs the completion interrupt.
    pub fn service(&mut self, handler: &CompletionHandler) -> Option<i16> {
        let step = self.step()?;
        if step.completed {
            handler.on_transfer_complete(self);
        }
        Some(step.sample)
    }
}

impl TransferEngine for StreamEngine {
    fn configure(&mut self, transfer: Transfer) {
        let length = transfer.length.min(self.arena.capacity());
        self.transfer = Some(Transfer { length, ..transfer });
        self.cursor = 0;
        self.enabled = false;
    }

    fn start(&mut self) {
        self.enabled = self.transfer.is_some_and(|t| t.length > 0);
    }
}
