//! MP3 playback through the default output device via rodio.
//!
//! The output stream is not `Send`, so a dedicated thread owns it and takes
//! commands over a channel. The thread polls the sink to notice when a
//! stream has drained.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rodio::{Decoder, OutputStream, Sink};
use tracing::{debug, error, info};

use super::backend::{Mp3Output, PlaybackDone};
use crate::types::PlaybackOutcome;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub type Mp3Source = Decoder<Cursor<Vec<u8>>>;

enum Command {
    Play {
        source: Mp3Source,
        rate: f32,
        done: PlaybackDone,
    },
    Stop,
    Shutdown,
}

pub struct RodioOutput {
    tx: Mutex<mpsc::Sender<Command>>,
    playing: Arc<AtomicBool>,
}

impl RodioOutput {
    /// Open the default output device on a new audio thread
    pub fn new() -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let playing = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&playing);

        thread::Builder::new()
            .name("guide-audio".to_string())
            .spawn(move || {
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => {
                        let _ = ready_tx.send(Ok(()));
                        pair
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(anyhow!("No audio output device: {}", e)));
                        return;
                    }
                };
                audio_loop(&handle, rx, flag);
            })
            .map_err(|e| anyhow!("Failed to spawn audio thread: {}", e))?;

        ready_rx
            .recv()
            .map_err(|e| anyhow!("Audio thread exited during startup: {}", e))??;

        info!("Audio output ready");
        Ok(Self {
            tx: Mutex::new(tx),
            playing,
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(command)
            .map_err(|_| anyhow!("Audio thread is not running"))
    }
}

fn audio_loop(
    handle: &rodio::OutputStreamHandle,
    rx: mpsc::Receiver<Command>,
    playing: Arc<AtomicBool>,
) {
    let mut current: Option<(Sink, PlaybackDone)> = None;

    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(Command::Play { source, rate, done }) => {
                if let Some((sink, old)) = current.take() {
                    sink.stop();
                    old.complete(PlaybackOutcome::Stopped);
                }

                match Sink::try_new(handle) {
                    Ok(sink) => {
                        sink.set_speed(rate);
                        sink.append(source);
                        sink.play();
                        playing.store(true, Ordering::SeqCst);
                        current = Some((sink, done));
                    }
                    Err(e) => {
                        error!("Sink creation failed: {}", e);
                        playing.store(false, Ordering::SeqCst);
                        done.complete(PlaybackOutcome::Failed(format!("sink error: {}", e)));
                    }
                }
            }
            Ok(Command::Stop) => {
                if let Some((sink, done)) = current.take() {
                    sink.stop();
                    done.complete(PlaybackOutcome::Stopped);
                    debug!("MP3 playback stopped");
                }
                playing.store(false, Ordering::SeqCst);
            }
            Ok(Command::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if let Some((sink, done)) = current.take() {
                    sink.stop();
                    done.complete(PlaybackOutcome::Stopped);
                }
                playing.store(false, Ordering::SeqCst);
                break;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        if current.as_ref().map(|(sink, _)| sink.empty()).unwrap_or(false) {
            if let Some((_, done)) = current.take() {
                done.complete(PlaybackOutcome::Ended);
            }
            playing.store(false, Ordering::SeqCst);
        }
    }

    debug!("Audio thread exiting");
}

/// Decode on the caller's thread; corrupt audio fails `play` itself
pub fn decode_mp3(audio: Vec<u8>) -> Result<Mp3Source> {
    Decoder::new(Cursor::new(audio)).map_err(|e| anyhow!("MP3 decode failed: {}", e))
}

impl Mp3Output for RodioOutput {
    fn play(&self, audio: Vec<u8>, rate: f32, done: PlaybackDone) -> Result<()> {
        let source = decode_mp3(audio)?;
        self.playing.store(true, Ordering::SeqCst);
        if let Err(e) = self.send(Command::Play { source, rate, done }) {
            self.playing.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    fn stop(&self) {
        if self.playing.load(Ordering::SeqCst) {
            let _ = self.send(Command::Stop);
        }
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        let _ = self.send(Command::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_audio_is_rejected_before_playback() {
        assert!(decode_mp3(Vec::new()).is_err());
        assert!(decode_mp3(b"not an mp3 at all".to_vec()).is_err());
    }
}
