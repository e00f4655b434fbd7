//! Windows adapters.
//!
//! Input comes from low-level keyboard and mouse hooks (SetWindowsHookEx).
//! The foreground window is polled with GetForegroundWindow.

use crate::collector::focus::{ForegroundWindow, PollingFocusProvider};
use crate::collector::input::{InputHook, InputSignal};
use crate::collector::{CollectorError, FocusProvider};
use crossbeam_channel::{bounded, Sender};
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use windows::core::PWSTR;
use windows::Win32::Foundation::{CloseHandle, HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::System::Threading::{
    GetCurrentThreadId, OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_WIN32,
    PROCESS_QUERY_LIMITED_INFORMATION,
};
use windows::Win32::UI::WindowsAndMessaging::{
    CallNextHookEx, GetForegroundWindow, GetMessageW, GetWindowTextW, GetWindowThreadProcessId,
    PostThreadMessageW, SetWindowsHookExW, UnhookWindowsHookEx, HHOOK, KBDLLHOOKSTRUCT, MSG,
    WH_KEYBOARD_LL, WH_MOUSE_LL, WM_KEYDOWN, WM_LBUTTONDOWN, WM_MOUSEHWHEEL,
    WM_MOUSEMOVE, WM_MOUSEWHEEL, WM_QUIT, WM_RBUTTONDOWN, WM_SYSKEYDOWN,
};

// Virtual key codes used for classification only.
const VK_BACK: u32 = 0x08;
const VK_DELETE: u32 = 0x2E;
const VK_CONTROL_KEYS: [u32; 3] = [0x11, 0xA2, 0xA3];
const VK_MODIFIERS: [u32; 9] = [0x10, 0x11, 0x12, 0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5];

thread_local! {
    static SIGNALS: RefCell<Option<Sender<InputSignal>>> = const { RefCell::new(None) };
    static CONTROL_DOWN: Cell<bool> = const { Cell::new(false) };
    static LEFT_BUTTON_DOWN: Cell<bool> = const { Cell::new(false) };
}

/// Input hook backed by low-level Windows hooks.
#[derive(Default)]
pub struct WindowsInputHook {
    hook_thread: Option<(u32, JoinHandle<()>)>,
}

impl WindowsInputHook {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InputHook for WindowsInputHook {
    fn start(&mut self, signals: Sender<InputSignal>) -> Result<(), CollectorError> {
        if self.hook_thread.is_some() {
            return Err(CollectorError::AlreadyRunning);
        }

        let (ready_tx, ready_rx) = bounded::<Result<u32, CollectorError>>(1);
        let handle = thread::Builder::new()
            .name("kmflow-input-hook".into())
            .spawn(move || run_hook_loop(signals, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(thread_id)) => {
                self.hook_thread = Some((thread_id, handle));
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(CollectorError::HookInstallationFailed(
                    "hook thread exited".into(),
                ))
            }
        }
    }

    fn stop(&mut self) {
        if let Some((thread_id, handle)) = self.hook_thread.take() {
            // GetMessageW blocks; WM_QUIT is the only way to wake it.
            unsafe {
                let _ = PostThreadMessageW(thread_id, WM_QUIT, WPARAM(0), LPARAM(0));
            }
            let _ = handle.join();
        }
    }
}

impl Drop for WindowsInputHook {
    fn drop(&mut self) {
        self.stop();
    }
}

fn send(signal: InputSignal) {
    SIGNALS.with(|s| {
        if let Some(ref tx) = *s.borrow() {
            let _ = tx.try_send(signal);
        }
    });
}

/// Key class from a virtual key code. The code itself never leaves here.
fn classify_key(vk: u32, alt_held: bool, control_held: bool) -> Option<InputSignal> {
    if VK_MODIFIERS.contains(&vk) {
        return None;
    }
    if alt_held || control_held {
        return Some(InputSignal::SpecialKey);
    }
    Some(match vk {
        VK_BACK | VK_DELETE => InputSignal::Backspace,
        // tab, return, escape, page/arrow block, F1-F24
        0x09 | 0x0D | 0x1B | 0x21..=0x28 | 0x70..=0x87 => InputSignal::SpecialKey,
        _ => InputSignal::Character,
    })
}

unsafe extern "system" fn keyboard_hook_proc(
    n_code: i32,
    w_param: WPARAM,
    l_param: LPARAM,
) -> LRESULT {
    if n_code >= 0 {
        let kb = &*(l_param.0 as *const KBDLLHOOKSTRUCT);
        let message = w_param.0 as u32;

        if VK_CONTROL_KEYS.contains(&kb.vkCode) {
            CONTROL_DOWN.with(|c| c.set(matches!(message, WM_KEYDOWN | WM_SYSKEYDOWN)));
        } else if matches!(message, WM_KEYDOWN | WM_SYSKEYDOWN) {
            let alt = message == WM_SYSKEYDOWN;
            let control = CONTROL_DOWN.with(|c| c.get());
            if let Some(signal) = classify_key(kb.vkCode, alt, control) {
                send(signal);
            }
        }
    }
    CallNextHookEx(HHOOK::default(), n_code, w_param, l_param)
}

unsafe extern "system" fn mouse_hook_proc(n_code: i32, w_param: WPARAM, l_param: LPARAM) -> LRESULT {
    if n_code >= 0 {
        let signal = match w_param.0 as u32 {
            WM_LBUTTONDOWN => {
                LEFT_BUTTON_DOWN.with(|b| b.set(true));
                Some(InputSignal::Click)
            }
            WM_RBUTTONDOWN => Some(InputSignal::Click),
            WM_MOUSEMOVE if LEFT_BUTTON_DOWN.with(|b| b.get()) => {
                // One drag per press, not one per pixel.
                LEFT_BUTTON_DOWN.with(|b| b.set(false));
                Some(InputSignal::Drag)
            }
            WM_MOUSEWHEEL | WM_MOUSEHWHEEL => Some(InputSignal::Scroll),
            _ => None,
        };
        if let Some(signal) = signal {
            send(signal);
        }
    }
    CallNextHookEx(HHOOK::default(), n_code, w_param, l_param)
}

fn run_hook_loop(signals: Sender<InputSignal>, ready: Sender<Result<u32, CollectorError>>) {
    SIGNALS.with(|s| *s.borrow_mut() = Some(signals));

    unsafe {
        let keyboard = match SetWindowsHookExW(WH_KEYBOARD_LL, Some(keyboard_hook_proc), None, 0) {
            Ok(hook) => hook,
            Err(e) => {
                let _ = ready.send(Err(CollectorError::HookInstallationFailed(e.to_string())));
                return;
            }
        };
        let mouse = match SetWindowsHookExW(WH_MOUSE_LL, Some(mouse_hook_proc), None, 0) {
            Ok(hook) => hook,
            Err(e) => {
                let _ = UnhookWindowsHookEx(keyboard);
                let _ = ready.send(Err(CollectorError::HookInstallationFailed(e.to_string())));
                return;
            }
        };

        let _ = ready.send(Ok(GetCurrentThreadId()));

        // Hooks run inside GetMessageW; messages themselves need no dispatch.
        let mut msg = MSG::default();
        while GetMessageW(&mut msg, HWND::default(), 0, 0).0 > 0 {}

        let _ = UnhookWindowsHookEx(mouse);
        let _ = UnhookWindowsHookEx(keyboard);
    }

    SIGNALS.with(|s| *s.borrow_mut() = None);
}

/// Current foreground window with its owning executable path.
pub fn foreground_window() -> Option<ForegroundWindow> {
    unsafe {
        let hwnd = GetForegroundWindow();
        if hwnd.0.is_null() {
            return None;
        }

        let mut title = [0u16; 512];
        let len = GetWindowTextW(hwnd, &mut title);
        let window_title = (len > 0).then(|| String::from_utf16_lossy(&title[..len as usize]));

        let mut pid = 0u32;
        GetWindowThreadProcessId(hwnd, Some(&mut pid));
        let executable = (pid != 0).then(|| executable_path(pid)).flatten();

        Some(ForegroundWindow {
            bundle_id: None,
            executable,
            window_title,
            secure_input: false,
        })
    }
}

unsafe fn executable_path(pid: u32) -> Option<String> {
    let process = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid).ok()?;
    let mut buf = [0u16; 1024];
    let mut size = buf.len() as u32;
    let result = QueryFullProcessImageNameW(
        process,
        PROCESS_NAME_WIN32,
        PWSTR(buf.as_mut_ptr()),
        &mut size,
    );
    let _ = CloseHandle(process);
    result.ok()?;
    Some(String::from_utf16_lossy(&buf[..size as usize]))
}

pub fn platform_focus_provider() -> Arc<dyn FocusProvider> {
    Arc::new(PollingFocusProvider::new(
        Arc::new(foreground_window),
        Duration::from_millis(500),
    ))
}

/// Low-level hooks need no explicit grant, but may be blocked by policy.
/// Installs and removes a temporary hook to find out.
pub fn check_permission() -> bool {
    unsafe {
        match SetWindowsHookExW(WH_KEYBOARD_LL, Some(keyboard_hook_proc), None, 0) {
            Ok(hook) => {
                let _ = UnhookWindowsHookEx(hook);
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_classes() {
        assert_eq!(classify_key(0x41, false, false), Some(InputSignal::Character));
        assert_eq!(classify_key(VK_BACK, false, false), Some(InputSignal::Backspace));
        assert_eq!(classify_key(0x0D, false, false), Some(InputSignal::SpecialKey));
        assert_eq!(classify_key(0x43, false, true), Some(InputSignal::SpecialKey));
        assert_eq!(classify_key(0x10, false, false), None);
    }

    #[test]
    fn test_hook_creation() {
        let hook = WindowsInputHook::new();
        assert!(hook.hook_thread.is_none());
    }
}
