//! Per-session recording management.
//!
//! A session can record at most one sink per medium. Starting a recording
//! is all-or-nothing across the media named in one request: if any sink
//! fails to open (or a medium is already being recorded), every sink the
//! request had already opened is closed and discarded.

use anyhow::{anyhow, Result};

use crate::host::{Host, Recorder};
use crate::session::{Medium, Session};

/// One medium's worth of a `startRecording` request.
#[derive(Debug)]
pub(crate) struct RecordingSpec {
    pub medium: Medium,
    pub codec: String,
    pub folder: String,
    pub filename: String,
}

/// The recorders currently open for a session, one slot per medium.
#[derive(Default)]
pub(crate) struct RecorderSet {
    audio: Option<Box<dyn Recorder>>,
    video: Option<Box<dyn Recorder>>,
    data: Option<Box<dyn Recorder>>,
}

impl RecorderSet {
    fn slot_mut(&mut self, medium: Medium) -> &mut Option<Box<dyn Recorder>> {
        match medium {
            Medium::Audio => &mut self.audio,
            Medium::Video => &mut self.video,
            Medium::Data => &mut self.data,
        }
    }

    pub fn is_recording(&self, medium: Medium) -> bool {
        match medium {
            Medium::Audio => self.audio.is_some(),
            Medium::Video => self.video.is_some(),
            Medium::Data => self.data.is_some(),
        }
    }

    /// Append a frame to the recorder for `medium`, if one is open.
    /// Write failures are logged and otherwise ignored: recording must never
    /// stall the media path.
    pub fn save_frame(&mut self, medium: Medium, buf: &[u8]) {
        if let Some(recorder) = self.slot_mut(medium) {
            if let Err(e) = recorder.save_frame(buf) {
                log::warn!("Failed to record {} frame: {e}", medium.as_str());
            }
        }
    }

    /// Close and drop the recorder for `medium`. Returns whether one was open.
    pub fn stop(&mut self, medium: Medium) -> bool {
        match self.slot_mut(medium).take() {
            Some(mut recorder) => {
                recorder.close();
                true
            }
            None => false,
        }
    }

    /// Close every open recorder. Used at session teardown.
    pub fn close_all(&mut self) {
        for medium in [Medium::Audio, Medium::Video, Medium::Data] {
            self.stop(medium);
        }
    }
}

/// Open recorders for every spec in `specs` and install them on `session`.
///
/// Holds the session's recording lock for the whole request so a concurrent
/// start/stop cannot interleave. On any failure, sinks opened by this call
/// are closed and nothing is installed.
pub(crate) fn start(host: &dyn Host, session: &Session, specs: &[RecordingSpec]) -> Result<()> {
    let mut recorders = session.lock_recorders();
    let mut pending: Vec<(Medium, Box<dyn Recorder>)> = Vec::with_capacity(specs.len());

    let result = (|| {
        for spec in specs {
            if recorders.is_recording(spec.medium)
                || pending.iter().any(|(m, _)| *m == spec.medium)
            {
                return Err(anyhow!("duplicate {} recording", spec.medium.as_str()));
            }
            let recorder = host
                .create_recorder(&spec.folder, &spec.codec, &spec.filename)
                .map_err(|e| anyhow!("error creating '{}' recorder: {e}", spec.medium.as_str()))?;
            pending.push((spec.medium, recorder));
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            for (medium, recorder) in pending {
                *recorders.slot_mut(medium) = Some(recorder);
            }
            Ok(())
        }
        Err(e) => {
            for (_, mut recorder) in pending {
                recorder.close();
            }
            Err(e)
        }
    }
}

/// Close and clear the recorders for the named media. Stopping a medium that
/// is not being recorded is a no-op.
pub(crate) fn stop(session: &Session, media: &[Medium]) {
    let mut recorders = session.lock_recorders();
    for medium in media {
        if recorders.stop(*medium) {
            log::debug!("Stopped {} recording for session {}", medium.as_str(), session.id());
        }
    }
}
