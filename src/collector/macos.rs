//! macOS adapters.
//!
//! Input comes from a listen-only CGEvent tap and requires the Input
//! Monitoring permission. The foreground window is read from the
//! CoreGraphics window list.

use crate::collector::focus::{ForegroundWindow, PollingFocusProvider};
use crate::collector::input::{InputHook, InputSignal};
use crate::collector::{CollectorError, FocusProvider};
use core_foundation::base::{CFType, TCFType};
use core_foundation::dictionary::CFDictionary;
use core_foundation::number::CFNumber;
use core_foundation::runloop::{kCFRunLoopCommonModes, CFRunLoop};
use core_foundation::string::CFString;
use core_graphics::event::{
    CGEvent, CGEventFlags, CGEventTap, CGEventTapLocation, CGEventTapOptions, CGEventTapPlacement,
    CGEventType, CallbackResult, EventField,
};
use core_graphics::window::{
    copy_window_info, kCGNullWindowID, kCGWindowLayer, kCGWindowListExcludeDesktopElements,
    kCGWindowListOptionOnScreenOnly, kCGWindowName, kCGWindowOwnerName,
};
use crossbeam_channel::{bounded, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[link(name = "Carbon", kind = "framework")]
extern "C" {
    fn IsSecureEventInputEnabled() -> u8;
}

// Virtual key codes used for classification only.
const KEY_DELETE: i64 = 51;
const KEY_FORWARD_DELETE: i64 = 117;
const SPECIAL_KEYS: &[i64] = &[
    36, 48, 53, 76, // return, tab, escape, keypad enter
    115, 116, 119, 121, // home, page up, end, page down
    123, 124, 125, 126, // arrows
    122, 120, 99, 118, 96, 97, 98, 100, 101, 109, 103, 111, // F1-F12
];

/// Input hook backed by a CGEvent tap.
pub struct MacOSInputHook {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl MacOSInputHook {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }
}

impl Default for MacOSInputHook {
    fn default() -> Self {
        Self::new()
    }
}

impl InputHook for MacOSInputHook {
    fn start(&mut self, signals: Sender<InputSignal>) -> Result<(), CollectorError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(CollectorError::AlreadyRunning);
        }
        self.running.store(true, Ordering::SeqCst);

        // The tap is created on the worker thread; report its outcome back so
        // a missing permission fails start() instead of a silent dead hook.
        let (ready_tx, ready_rx) = bounded::<Result<(), CollectorError>>(1);
        let running = self.running.clone();
        let handle = thread::Builder::new()
            .name("kmflow-cgevent-tap".into())
            .spawn(move || {
                run_event_loop(signals, running.clone(), ready_tx);
                running.store(false, Ordering::SeqCst);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.thread_handle = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(CollectorError::HookInstallationFailed(
                    "event tap thread exited".into(),
                ))
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MacOSInputHook {
    fn drop(&mut self) {
        self.stop();
    }
}

fn tapped_event_types() -> Vec<CGEventType> {
    vec![
        CGEventType::KeyDown,
        CGEventType::LeftMouseDown,
        CGEventType::RightMouseDown,
        CGEventType::LeftMouseDragged,
        CGEventType::RightMouseDragged,
        CGEventType::ScrollWheel,
    ]
}

fn run_event_loop(
    signals: Sender<InputSignal>,
    running: Arc<AtomicBool>,
    ready: Sender<Result<(), CollectorError>>,
) {
    let tap = CGEventTap::new(
        CGEventTapLocation::Session,
        CGEventTapPlacement::HeadInsertEventTap,
        CGEventTapOptions::ListenOnly,
        tapped_event_types(),
        move |_proxy, event_type, event| {
            if let Some(signal) = classify(event_type, event) {
                // Never block the tap; drop the signal when the worker lags.
                let _ = signals.try_send(signal);
            }
            CallbackResult::Keep
        },
    );
    let tap = match tap {
        Ok(tap) => tap,
        Err(()) => {
            let _ = ready.send(Err(CollectorError::PermissionDenied("Input Monitoring")));
            return;
        }
    };

    let source = match tap.mach_port().create_runloop_source(0) {
        Ok(source) => source,
        Err(()) => {
            let _ = ready.send(Err(CollectorError::HookInstallationFailed(
                "failed to create run loop source".into(),
            )));
            return;
        }
    };

    let run_loop = CFRunLoop::get_current();
    unsafe {
        run_loop.add_source(&source, kCFRunLoopCommonModes);
    }
    tap.enable();
    let _ = ready.send(Ok(()));

    while running.load(Ordering::SeqCst) {
        CFRunLoop::run_in_mode(
            unsafe { kCFRunLoopCommonModes },
            Duration::from_millis(100),
            false,
        );
    }
}

/// Map a tapped event to its class. The key code is read only to tell
/// characters from editing and navigation keys and is dropped here.
fn classify(event_type: CGEventType, event: &CGEvent) -> Option<InputSignal> {
    match event_type {
        CGEventType::KeyDown => {
            let flags = event.get_flags();
            if flags.intersects(CGEventFlags::CGEventFlagCommand | CGEventFlags::CGEventFlagControl)
            {
                return Some(InputSignal::SpecialKey);
            }
            let code = event.get_integer_value_field(EventField::KEYBOARD_EVENT_KEYCODE);
            Some(match code {
                KEY_DELETE | KEY_FORWARD_DELETE => InputSignal::Backspace,
                c if SPECIAL_KEYS.contains(&c) => InputSignal::SpecialKey,
                _ => InputSignal::Character,
            })
        }
        CGEventType::LeftMouseDown | CGEventType::RightMouseDown => Some(InputSignal::Click),
        CGEventType::LeftMouseDragged | CGEventType::RightMouseDragged => Some(InputSignal::Drag),
        CGEventType::ScrollWheel => Some(InputSignal::Scroll),
        _ => None,
    }
}

/// Frontmost normal-layer window from the on-screen window list.
pub fn foreground_window() -> Option<ForegroundWindow> {
    let windows = copy_window_info(
        kCGWindowListOptionOnScreenOnly | kCGWindowListExcludeDesktopElements,
        kCGNullWindowID,
    )?;

    let layer_key = unsafe { CFString::wrap_under_get_rule(kCGWindowLayer) };
    let owner_key = unsafe { CFString::wrap_under_get_rule(kCGWindowOwnerName) };
    let name_key = unsafe { CFString::wrap_under_get_rule(kCGWindowName) };

    for item in windows.iter() {
        let info: CFDictionary<CFString, CFType> =
            unsafe { CFDictionary::wrap_under_get_rule(*item as _) };

        let layer = info
            .find(&layer_key)
            .and_then(|v| v.downcast::<CFNumber>())
            .and_then(|n| n.to_i64());
        if layer != Some(0) {
            continue;
        }

        let owner = info
            .find(&owner_key)
            .and_then(|v| v.downcast::<CFString>())
            .map(|s| s.to_string());
        let title = info
            .find(&name_key)
            .and_then(|v| v.downcast::<CFString>())
            .map(|s| s.to_string())
            .filter(|t| !t.is_empty());

        return Some(ForegroundWindow {
            bundle_id: None,
            executable: owner,
            window_title: title,
            secure_input: unsafe { IsSecureEventInputEnabled() != 0 },
        });
    }
    None
}

pub fn platform_focus_provider() -> Arc<dyn FocusProvider> {
    Arc::new(PollingFocusProvider::new(
        Arc::new(foreground_window),
        Duration::from_millis(500),
    ))
}

/// Whether Input Monitoring is granted. macOS has no direct query, so this
/// tries to create a passive tap.
pub fn check_permission() -> bool {
    CGEventTap::new(
        CGEventTapLocation::Session,
        CGEventTapPlacement::HeadInsertEventTap,
        CGEventTapOptions::ListenOnly,
        vec![CGEventType::KeyDown],
        |_proxy, _type, _event| CallbackResult::Keep,
    )
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_creation() {
        let hook = MacOSInputHook::new();
        assert!(!hook.running.load(Ordering::SeqCst));
    }

    #[test]
    fn test_tap_event_list() {
        // Key down, two clicks, two drags, scroll. No key-up or pointer motion.
        assert_eq!(tapped_event_types().len(), 6);
    }
}
