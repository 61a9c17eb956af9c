// src/main.rs
#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]
mod app;
mod backend;
mod communication;
mod logging;

use crate::app::SaimApp;
use crate::backend::backend_loop;
use crate::communication::{Command, Update};
use crossbeam_channel::unbounded;
use egui::{Context, FontData, FontDefinitions, FontFamily};
use std::thread;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[cfg(target_os = "windows")]
const CJK_FONT_PATHS: &[&str] = &[
    r"C:\Windows\Fonts\msyh.ttc",
    r"C:\Windows\Fonts\simsun.ttc",
    r"C:\Windows\Fonts\simhei.ttf",
];

#[cfg(target_os = "macos")]
const CJK_FONT_PATHS: &[&str] = &[
    "/System/Library/Fonts/PingFang.ttc",
    "/System/Library/Fonts/STHeiti Light.ttc",
    "/System/Library/Fonts/Hiragino Sans GB.ttc",
];

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const CJK_FONT_PATHS: &[&str] = &[
    "/usr/share/fonts/opentype/noto/NotoSansCJK-Regular.ttc",
    "/usr/share/fonts/noto-cjk/NotoSansCJK-Regular.ttc",
    "/usr/share/fonts/truetype/wqy/wqy-microhei.ttc",
    "/usr/share/fonts/truetype/droid/DroidSansFallbackFull.ttf",
];

/// Adds a system CJK font as fallback so the log view can show Chinese messages.
fn setup_fonts(ctx: &Context) {
    let Some((path, data)) = CJK_FONT_PATHS
        .iter()
        .find_map(|path| std::fs::read(path).ok().map(|data| (path, data)))
    else {
        warn!("未找到中文字体，日志中的中文可能无法显示");
        return;
    };

    let mut fonts = FontDefinitions::default();
    fonts
        .font_data
        .insert("cjk".to_owned(), FontData::from_owned(data));
    for family in [FontFamily::Proportional, FontFamily::Monospace] {
        fonts
            .families
            .entry(family)
            .or_default()
            .push("cjk".to_owned());
    }
    ctx.set_fonts(fonts);
    info!("使用字体：{}", path);
}

fn main() -> eframe::Result<()> {
    let (cmd_tx, cmd_rx) = unbounded::<Command>();
    let (update_tx, update_rx) = unbounded::<Update>();
    let panel_layer = logging::PanelLogLayer::new(update_tx.clone());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stdout))
        .with(panel_layer)
        // RUST_LOG 可覆盖默认级别，例如 `RUST_LOG=info,saim_control=debug`
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let backend_handle = thread::spawn(move || {
        backend_loop(cmd_rx, update_tx);
    });

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default().with_inner_size([1200.0, 760.0]),
        ..Default::default()
    };

    eframe::run_native(
        "SAIM Acquisition",
        options,
        Box::new(|cc| {
            setup_fonts(&cc.egui_ctx);
            Box::new(SaimApp::new(cc, cmd_tx, update_rx, Some(backend_handle)))
        }),
    )
}
