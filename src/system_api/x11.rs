use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use anyhow::Result;
use tracing::{debug, error, instrument};
use xcb::{
    x::{self, Atom, GetProperty, GrabServer, InternAtom, UngrabServer, Window, ATOM_ANY},
    xinput, Connection, Xid,
};

use super::{
    ForegroundProbe, ForegroundWindow, InputEvent, InputObserver, InputSink, InputSubscription,
    RawText,
};

fn intern_atom(conn: &Connection, name: &[u8]) -> Result<Atom> {
    let reply = conn.wait_for_reply(conn.send_request(&InternAtom {
        only_if_exists: false,
        name,
    }))?;
    Ok(reply.atom())
}

fn get_active_window(conn: &Connection, root: Window, active_window_atom: Atom) -> Result<Option<Window>> {
    let result = conn.wait_for_reply(conn.send_request(&GetProperty {
        delete: false,
        window: root,
        property: active_window_atom,
        r#type: ATOM_ANY,
        long_offset: 0,
        long_length: 1,
    }))?;
    let windows = result.value::<Window>();
    Ok(windows.first().copied())
}

fn get_pid(conn: &Connection, window: Window, pid_atom: Atom) -> Result<Option<u32>> {
    let result = conn.wait_for_reply(conn.send_request(&GetProperty {
        delete: false,
        window,
        property: pid_atom,
        r#type: ATOM_ANY,
        long_offset: 0,
        long_length: 1,
    }))?;
    let result_slice = result.value::<u32>();
    if result_slice.is_empty() {
        return Ok(None);
    }
    Ok(Some(result_slice[0]))
}

fn get_property_bytes(
    conn: &Connection,
    window: Window,
    property: Atom,
) -> Result<Vec<u8>> {
    let reply = conn.wait_for_reply(conn.send_request(&GetProperty {
        delete: false,
        window,
        property,
        r#type: ATOM_ANY,
        long_offset: 0,
        long_length: 1024,
    }))?;
    Ok(reply.value::<u8>().to_vec())
}

/// WM_CLASS is two NUL-terminated strings, "instance\0class\0". The class
/// segment is the stable one ("Firefox" rather than "Navigator").
fn class_segment(raw: &[u8]) -> Vec<u8> {
    let mut segments = raw
        .split(|byte| *byte == 0)
        .filter(|segment| !segment.is_empty());
    let instance = segments.next();
    segments
        .next()
        .or(instance)
        .map(|segment| segment.to_vec())
        .unwrap_or_default()
}

pub struct X11ForegroundProbe {
    connection: Connection,
    preferred_screen: i32,
    active_window_atom: Atom,
    window_name_atom: Atom,
    pid_atom: Atom,
}

impl X11ForegroundProbe {
    pub fn new() -> Result<Self> {
        let (connection, preferred_screen) = Connection::connect(None)?;
        let active_window_atom = intern_atom(&connection, b"_NET_ACTIVE_WINDOW")?;
        let window_name_atom = intern_atom(&connection, b"_NET_WM_NAME")?;
        let pid_atom = intern_atom(&connection, b"_NET_WM_PID")?;
        Ok(Self {
            connection,
            preferred_screen,
            active_window_atom,
            window_name_atom,
            pid_atom,
        })
    }

    fn root(&self) -> Result<Window> {
        let setup = self.connection.get_setup();
        setup
            .roots()
            .nth(self.preferred_screen.max(0) as usize)
            .map(|screen| screen.root())
            .ok_or_else(|| anyhow::anyhow!("preferred X11 screen is gone"))
    }

    #[instrument(skip(self))]
    fn active_inner(&self) -> Result<Option<ForegroundWindow>> {
        let root = self.root()?;

        let Some(window) = get_active_window(&self.connection, root, self.active_window_atom)?
        else {
            return Ok(None);
        };
        // A zeroed property means no window is focused right now.
        if window.resource_id() == 0 {
            return Ok(None);
        }

        let process_id = get_pid(&self.connection, window, self.pid_atom)?;
        let class = class_segment(&get_property_bytes(
            &self.connection,
            window,
            x::ATOM_WM_CLASS,
        )?);
        let mut title = get_property_bytes(&self.connection, window, self.window_name_atom)?;
        if title.is_empty() {
            title = get_property_bytes(&self.connection, window, x::ATOM_WM_NAME)?;
        }

        if process_id.is_none() && class.is_empty() {
            return Ok(None);
        }

        Ok(Some(ForegroundWindow {
            process_id,
            window_class: RawText::Bytes(class),
            window_title: RawText::Bytes(title),
        }))
    }
}

impl ForegroundProbe for X11ForegroundProbe {
    #[instrument(skip(self))]
    fn active_window(&mut self) -> Result<Option<ForegroundWindow>> {
        let _ = self.connection.send_request(&GrabServer {});
        let result = self.active_inner();
        let _ = self.connection.send_request(&UngrabServer {});
        result
    }
}

/// Global input observer built on XInput2 raw events. Raw events arrive for
/// every device regardless of which window has focus, which is exactly the
/// "count occurrences" contract.
pub struct X11InputObserver {
    active: Option<Arc<AtomicBool>>,
}

impl X11InputObserver {
    pub fn new() -> Result<Self> {
        // Probe the connection once so construction fails fast on headless
        // machines.
        let (connection, _) = Connection::connect(None)?;
        drop(connection);
        Ok(Self { active: None })
    }
}

impl InputObserver for X11InputObserver {
    fn subscribe(&mut self, sink: InputSink) -> Result<InputSubscription> {
        // A previous subscription might still be parked in wait_for_event;
        // flag it down before arming a new one.
        if let Some(active) = self.active.take() {
            active.store(false, Ordering::SeqCst);
        }

        let (connection, preferred_screen) = Connection::connect(None)?;
        let setup = connection.get_setup();
        let root = setup
            .roots()
            .nth(preferred_screen.max(0) as usize)
            .map(|screen| screen.root())
            .ok_or_else(|| anyhow::anyhow!("preferred X11 screen is gone"))?;

        connection.check_request(connection.send_request_checked(&xinput::XiSelectEvents {
            window: root,
            masks: &[xinput::EventMaskBuf::new(
                xinput::Device::AllMaster,
                &[xinput::XiEventMask::RAW_KEY_PRESS
                    | xinput::XiEventMask::RAW_BUTTON_PRESS
                    | xinput::XiEventMask::RAW_MOTION],
            )],
        }))?;

        let active = Arc::new(AtomicBool::new(true));
        self.active = Some(active.clone());

        let thread_active = active.clone();
        thread::Builder::new()
            .name("activetime-xinput".into())
            .spawn(move || {
                debug!("X11 input thread started");
                loop {
                    if !thread_active.load(Ordering::SeqCst) {
                        break;
                    }
                    let event = match connection.wait_for_event() {
                        Ok(event) => event,
                        Err(e) => {
                            error!("X11 event stream closed {e:?}");
                            break;
                        }
                    };
                    if !thread_active.load(Ordering::SeqCst) {
                        break;
                    }
                    if let xcb::Event::Input(event) = event {
                        let input = match event {
                            xinput::Event::RawKeyPress(_) => InputEvent::KeyDown,
                            xinput::Event::RawButtonPress(press) => {
                                // Buttons 4..=7 are the scroll wheel axes.
                                if (4..=7).contains(&press.detail()) {
                                    InputEvent::Wheel
                                } else {
                                    InputEvent::MouseDown
                                }
                            }
                            xinput::Event::RawMotion(_) => InputEvent::MouseMove,
                            _ => continue,
                        };
                        sink(input);
                    }
                }
                debug!("X11 input thread stopped");
            })
            .map_err(|e| anyhow::anyhow!("failed to spawn X11 input thread: {e}"))?;

        Ok(InputSubscription::new(move || {
            // The thread wakes on the next event and exits; joining here
            // could park forever on an idle machine.
            active.store(false, Ordering::SeqCst);
        }))
    }
}

impl Drop for X11InputObserver {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.store(false, Ordering::SeqCst);
        }
    }
}
