//! Fob role and its operator shell.

use crate::config::SessionConfig;
use crate::feature;
use crate::link::MessageLink;
use crate::message::Message;
use crate::pairing;
use crate::state::{DeviceState, Persisted};
use crate::unlock;
use crate::{Error, ErrorKind, Policy, Result};
use keyfob_platform::{ByteChannel, RecordStore};
use std::io::{BufRead, Write};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// The fob device.
pub struct Fob<C, S> {
    link: MessageLink<C>,
    state: Persisted<DeviceState, S>,
    config: SessionConfig,
}

impl<C: ByteChannel, S: RecordStore> Fob<C, S> {
    /// Boots the fob.
    ///
    /// `factory` is the state this firmware ships with; it is used and
    /// persisted when the store is erased or corrupt. The board-link key
    /// comes from the stored pairing record, or from `config` if unpaired.
    pub fn boot(
        channel: C,
        store: S,
        factory: impl FnOnce() -> DeviceState,
        config: SessionConfig,
    ) -> Result<Self> {
        let state = Persisted::open(store, factory)?;
        let key = state
            .get()
            .pairing
            .as_ref()
            .map(|p| p.secret.clone())
            .or_else(|| config.shared_secret.clone());
        info!(paired = state.get().is_paired(), "fob booted");
        Ok(Self {
            link: MessageLink::new(channel, key),
            state,
            config,
        })
    }

    /// Current committed state.
    pub fn state(&self) -> &DeviceState {
        self.state.get()
    }

    /// Whether the fob is paired.
    pub fn is_paired(&self) -> bool {
        self.state.get().is_paired()
    }

    /// Board link.
    pub fn link_mut(&mut self) -> &mut MessageLink<C> {
        &mut self.link
    }

    /// Paired fob: sends the pairing record if `candidate_pin` is right.
    ///
    /// # Errors
    ///
    /// - `Policy::NotPaired` on an unpaired fob
    /// - `Policy::PinMismatch` if the PIN is wrong
    pub fn offer_pairing(&mut self, candidate_pin: &[u8]) -> Result<()> {
        let record = self.state.get().pairing.as_ref().ok_or(Policy::NotPaired)?;
        pairing::offer(&mut self.link, record, candidate_pin)
    }

    /// Unpaired fob: waits for a PAIR message and adopts its record.
    ///
    /// The new state is persisted before the key is switched and before
    /// this returns.
    ///
    /// # Returns
    /// The car id now paired to.
    pub fn accept_pairing(&mut self) -> Result<u32> {
        if self.is_paired() {
            return Err(Policy::AlreadyPaired.into());
        }
        let record = pairing::accept(&mut self.link, self.config.protocol_timeout)?;
        let car_id = record.car_id;
        let secret = record.secret.clone();

        self.state.update(|s| {
            s.features.car_id = car_id;
            s.pairing = Some(record);
            Ok(())
        })?;
        self.link.set_key(secret);
        info!(car_id, "fob paired");
        Ok(car_id)
    }

    /// Validates and stores a hex feature package.
    ///
    /// # Returns
    /// The enabled feature id.
    pub fn enable(&mut self, package_hex: &str) -> Result<u8> {
        let authority = &self.config.authority_key;
        self.state
            .update(|s| feature::enable(s, authority, package_hex))
    }

    /// Unlocks the car, then presents the feature set to start it.
    ///
    /// # Errors
    ///
    /// - `Policy::NotPaired` on an unpaired fob
    /// - `Error::Denied` if the car refused the nonce
    pub fn unlock_and_start(&mut self) -> Result<()> {
        if !self.is_paired() {
            return Err(Policy::NotPaired.into());
        }
        unlock::request(&mut self.link, self.config.protocol_timeout)?;
        self.link.send(&Message::start(&self.state.get().features))?;
        debug!(count = self.state.get().features.count(), "start sent");
        Ok(())
    }
}

impl<C, S> std::fmt::Debug for Fob<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fob").finish_non_exhaustive()
    }
}

/// Line-oriented operator interface to a [`Fob`].
///
/// Commands:
/// - `pair`: on a paired fob, prompts `P` and reads a PIN line; on an
///   unpaired fob, waits for a pairing record and answers `Paired`
/// - `enable`: reads a hex package line and answers `Enabled`
/// - `unlock`: runs unlock and start (the button press)
///
/// Refusals produce no output. CR, LF and NUL all end a line.
pub struct FobShell<'a, C, S, I, O> {
    fob: &'a mut Fob<C, S>,
    input: I,
    output: O,
}

impl<'a, C, S, I, O> FobShell<'a, C, S, I, O>
where
    C: ByteChannel,
    S: RecordStore,
    I: BufRead,
    O: Write,
{
    /// Shell reading commands from `input` and answering on `output`.
    pub fn new(fob: &'a mut Fob<C, S>, input: I, output: O) -> Self {
        Self { fob, input, output }
    }

    /// Runs commands until `input` ends.
    pub fn run(&mut self) -> Result<()> {
        while let Some(line) = self.read_line()? {
            let command = String::from_utf8_lossy(&line).into_owned();
            self.execute(command.trim())?;
        }
        Ok(())
    }

    /// Runs one command. Unknown commands are ignored.
    ///
    /// # Errors
    ///
    /// Link and operator-channel failures only; refusals are swallowed.
    pub fn execute(&mut self, command: &str) -> Result<()> {
        let result = match command {
            "pair" => self.pair(),
            "enable" => self.enable(),
            "unlock" => self.fob.unlock_and_start(),
            other => {
                debug!(command = other, "unknown command");
                Ok(())
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if is_refusal(&e) => {
                debug!(command, error = %e, "command refused");
                Ok(())
            }
            Err(e) => {
                warn!(command, error = %e, "command failed");
                Err(e)
            }
        }
    }

    /// Operator channel.
    pub fn output(&self) -> &O {
        &self.output
    }

    fn pair(&mut self) -> Result<()> {
        if self.fob.is_paired() {
            self.respond("P")?;
            let pin = match self.read_line()? {
                Some(pin) => pin,
                None => return Ok(()),
            };
            self.fob.offer_pairing(&pin)?;
            self.respond("PIN accepted")
        } else {
            self.fob.accept_pairing()?;
            self.respond("Paired")
        }
    }

    fn enable(&mut self) -> Result<()> {
        if !self.fob.is_paired() {
            return Err(Policy::NotPaired.into());
        }
        let line = match self.read_line()? {
            Some(line) => line,
            None => return Ok(()),
        };
        let package = String::from_utf8_lossy(&line).into_owned();
        self.fob.enable(&package)?;
        self.respond("Enabled")
    }

    fn respond(&mut self, text: &str) -> Result<()> {
        self.output.write_all(text.as_bytes())?;
        self.output.write_all(b"\n")?;
        self.output.flush()?;
        Ok(())
    }

    /// Next non-empty line, or `None` at end of input.
    fn read_line(&mut self) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let mut line = Zeroizing::new(Vec::new());
        loop {
            let (done, used) = {
                let buf = self.input.fill_buf()?;
                if buf.is_empty() {
                    return Ok(if line.is_empty() { None } else { Some(line) });
                }
                match buf.iter().position(|b| matches!(b, b'\r' | b'\n' | 0)) {
                    Some(end) => {
                        line.extend_from_slice(&buf[..end]);
                        (true, end + 1)
                    }
                    None => {
                        line.extend_from_slice(buf);
                        (false, buf.len())
                    }
                }
            };
            self.input.consume(used);
            if done && !line.is_empty() {
                return Ok(Some(line));
            }
        }
    }
}

/// Refusals stay invisible to the operator.
fn is_refusal(e: &Error) -> bool {
    !matches!(e.kind(), ErrorKind::StorageCorruption | ErrorKind::Io)
}
