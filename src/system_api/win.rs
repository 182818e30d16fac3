use std::{
    sync::{mpsc, Mutex},
    thread,
};

use anyhow::{anyhow, Result};
use tracing::{debug, error};
use windows::Win32::{
    Foundation::{HWND, LPARAM, LRESULT, WPARAM},
    System::{LibraryLoader::GetModuleHandleW, Threading::GetCurrentThreadId},
    UI::WindowsAndMessaging::{
        CallNextHookEx, DispatchMessageW, GetClassNameW, GetForegroundWindow, GetMessageW,
        GetWindowTextW, GetWindowThreadProcessId, PostThreadMessageW, SetWindowsHookExW,
        TranslateMessage, UnhookWindowsHookEx, HHOOK, MSG, WH_KEYBOARD_LL, WH_MOUSE_LL,
        WM_KEYDOWN, WM_LBUTTONDOWN, WM_MBUTTONDOWN, WM_MOUSEMOVE, WM_MOUSEWHEEL, WM_QUIT,
        WM_RBUTTONDOWN, WM_SYSKEYDOWN,
    },
};

use super::{
    ForegroundProbe, ForegroundWindow, InputEvent, InputObserver, InputSink, InputSubscription,
    RawText,
};

pub struct WinForegroundProbe {}

impl WinForegroundProbe {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for WinForegroundProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ForegroundProbe for WinForegroundProbe {
    fn active_window(&mut self) -> Result<Option<ForegroundWindow>> {
        let window = unsafe { GetForegroundWindow() };
        if window.is_invalid() {
            // Nothing focused (lock screen, desktop transition). Not an
            // error.
            return Ok(None);
        }

        let mut pid = 0u32;
        unsafe { GetWindowThreadProcessId(window, Some(&mut pid)) };

        let mut text = [0u16; 1024];
        let class = unsafe { read_class_name(window, &mut text) };
        let title = unsafe { read_window_title(window, &mut text) };

        if pid == 0 && class.is_empty() {
            return Ok(None);
        }

        Ok(Some(ForegroundWindow {
            process_id: (pid != 0).then_some(pid),
            window_class: RawText::Text(class),
            window_title: RawText::Text(title),
        }))
    }
}

unsafe fn read_class_name(window: HWND, text: &mut [u16]) -> String {
    let len = unsafe { GetClassNameW(window, text) };
    String::from_utf16_lossy(&text[..len.max(0) as usize])
}

unsafe fn read_window_title(window: HWND, text: &mut [u16]) -> String {
    let len = unsafe { GetWindowTextW(window, text) };
    String::from_utf16_lossy(&text[..len.max(0) as usize])
}

/// Low-level hook callbacks carry no user data, so the sink lives in a
/// process-wide slot. Only one subscription is ever active; the sampler
/// tears the old one down before re-arming.
static HOOK_SINK: Mutex<Option<InputSink>> = Mutex::new(None);

fn dispatch(event: InputEvent) {
    if let Ok(guard) = HOOK_SINK.lock() {
        if let Some(sink) = guard.as_ref() {
            sink(event);
        }
    }
}

unsafe extern "system" fn keyboard_hook(code: i32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    if code >= 0 {
        match wparam.0 as u32 {
            WM_KEYDOWN | WM_SYSKEYDOWN => dispatch(InputEvent::KeyDown),
            _ => {}
        }
    }
    unsafe { CallNextHookEx(None, code, wparam, lparam) }
}

unsafe extern "system" fn mouse_hook(code: i32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    if code >= 0 {
        match wparam.0 as u32 {
            WM_LBUTTONDOWN | WM_RBUTTONDOWN | WM_MBUTTONDOWN => dispatch(InputEvent::MouseDown),
            WM_MOUSEMOVE => dispatch(InputEvent::MouseMove),
            WM_MOUSEWHEEL => dispatch(InputEvent::Wheel),
            _ => {}
        }
    }
    unsafe { CallNextHookEx(None, code, wparam, lparam) }
}

unsafe fn install_hooks() -> Result<(HHOOK, HHOOK)> {
    let module = unsafe { GetModuleHandleW(None) }?;
    let keyboard =
        unsafe { SetWindowsHookExW(WH_KEYBOARD_LL, Some(keyboard_hook), module.into(), 0) }?;
    let mouse = match unsafe { SetWindowsHookExW(WH_MOUSE_LL, Some(mouse_hook), module.into(), 0) }
    {
        Ok(mouse) => mouse,
        Err(e) => {
            let _ = unsafe { UnhookWindowsHookEx(keyboard) };
            return Err(e.into());
        }
    };
    Ok((keyboard, mouse))
}

pub struct WinInputObserver {}

impl WinInputObserver {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for WinInputObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl InputObserver for WinInputObserver {
    fn subscribe(&mut self, sink: InputSink) -> Result<InputSubscription> {
        *HOOK_SINK.lock().expect("hook sink lock poisoned") = Some(sink);

        // Hooks only fire on the thread that installed them, and that
        // thread has to pump messages.
        let (ready_tx, ready_rx) = mpsc::channel();
        thread::Builder::new()
            .name("activetime-hooks".into())
            .spawn(move || {
                let hooks = unsafe { install_hooks() };
                let (keyboard, mouse) = match hooks {
                    Ok(hooks) => {
                        let thread_id = unsafe { GetCurrentThreadId() };
                        let _ = ready_tx.send(Ok(thread_id));
                        hooks
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                debug!("Input hook thread started");
                let mut message = MSG::default();
                while unsafe { GetMessageW(&mut message, HWND::default(), 0, 0) }.as_bool() {
                    unsafe {
                        let _ = TranslateMessage(&message);
                        DispatchMessageW(&message);
                    }
                }

                let _ = unsafe { UnhookWindowsHookEx(keyboard) }
                    .inspect_err(|e| error!("Failed to unhook keyboard {e:?}"));
                let _ = unsafe { UnhookWindowsHookEx(mouse) }
                    .inspect_err(|e| error!("Failed to unhook mouse {e:?}"));
                debug!("Input hook thread stopped");
            })
            .map_err(|e| anyhow!("failed to spawn hook thread: {e}"))?;

        let thread_id = ready_rx
            .recv()
            .map_err(|_| anyhow!("hook thread exited before signaling readiness"))??;

        Ok(InputSubscription::new(move || {
            *HOOK_SINK.lock().expect("hook sink lock poisoned") = None;
            let _ = unsafe { PostThreadMessageW(thread_id, WM_QUIT, WPARAM(0), LPARAM(0)) }
                .inspect_err(|e| error!("Failed to stop hook thread {e:?}"));
        }))
    }
}
