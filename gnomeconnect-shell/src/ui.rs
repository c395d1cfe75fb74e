//! Optional GTK device list window.
//!
//! Runs on its own thread with its own GLib main loop. The membership loop
//! feeds it registry snapshots; button clicks come back as commands that
//! main forwards to the engine.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{Context, Result};
use gtk::glib;
use gtk::prelude::*;
use tokio::sync::mpsc;
use tracing::warn;

use gnomeconnect_engine::Device;

const SIDEBAR_WIDTH: i32 = 200;

/// Commands originating from the window.
#[derive(Debug, Clone)]
pub enum UiCommand {
    Pair(String),
    Unpair(String),
    Browse(String),
}

struct DeviceView {
    name: gtk::Label,
    status: gtk::Label,
    icon: gtk::Image,
    pair_button: gtk::Button,
    browse_button: gtk::Button,
    container: gtk::Box,
}

struct State {
    devices: Vec<Device>,
    selected: Option<String>,
}

impl State {
    fn selected_device(&self) -> Option<&Device> {
        let id = self.selected.as_deref()?;
        self.devices.iter().find(|d| d.id == id)
    }
}

/// Spawn the window thread. Returns immediately; the window lives until
/// the user closes it.
pub fn spawn(
    snapshots: mpsc::Receiver<Vec<Device>>,
    commands: mpsc::Sender<UiCommand>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        if let Err(err) = run(snapshots, commands) {
            warn!(%err, "device window failed");
        }
    })
}

fn run(mut snapshots: mpsc::Receiver<Vec<Device>>, commands: mpsc::Sender<UiCommand>) -> Result<()> {
    gtk::init().context("Failed to initialize GTK")?;

    let state = Rc::new(RefCell::new(State {
        devices: Vec::new(),
        selected: None,
    }));

    let window = gtk::Window::builder()
        .title("GNOMEConnect")
        .default_width(800)
        .default_height(600)
        .build();

    let header = gtk::HeaderBar::new();
    header.set_title_widget(Some(&gtk::Label::new(Some("Devices"))));
    window.set_titlebar(Some(&header));

    let hbox = gtk::Box::new(gtk::Orientation::Horizontal, 0);
    window.set_child(Some(&hbox));

    let list = gtk::ListBox::new();
    let scroller = gtk::ScrolledWindow::builder()
        .min_content_width(SIDEBAR_WIDTH)
        .child(&list)
        .build();
    hbox.append(&scroller);
    hbox.append(&gtk::Separator::new(gtk::Orientation::Vertical));

    let view = build_device_view(&hbox);

    {
        let state = state.clone();
        let commands = commands.clone();
        view.pair_button.connect_clicked(move |_| {
            let state = state.borrow();
            if let Some(device) = state.selected_device() {
                let command = if device.paired {
                    UiCommand::Unpair(device.id.clone())
                } else {
                    UiCommand::Pair(device.id.clone())
                };
                if commands.try_send(command).is_err() {
                    warn!("dropping window command, channel full");
                }
            }
        });
    }

    {
        let state = state.clone();
        view.browse_button.connect_clicked(move |_| {
            let state = state.borrow();
            if let Some(device) = state.selected_device() {
                if commands.try_send(UiCommand::Browse(device.id.clone())).is_err() {
                    warn!("dropping window command, channel full");
                }
            }
        });
    }

    let view = Rc::new(view);
    {
        let state = state.clone();
        let view = view.clone();
        list.connect_row_selected(move |_, row| {
            // The borrow must end before touching widgets; GTK can re-enter
            // this handler synchronously.
            let device = {
                let mut state = state.borrow_mut();
                let selected = row
                    .and_then(|row| state.devices.get(row.index() as usize))
                    .map(|device| device.id.clone());
                state.selected = selected;
                state.selected_device().cloned()
            };
            show_selected(device.as_ref(), &view);
        });
    }

    let main_loop = glib::MainLoop::new(None, false);
    {
        let main_loop = main_loop.clone();
        window.connect_close_request(move |_| {
            main_loop.quit();
            glib::Propagation::Proceed
        });
    }

    {
        let state = state.clone();
        let view = view.clone();
        let list = list.clone();
        glib::MainContext::default().spawn_local(async move {
            while let Some(devices) = snapshots.recv().await {
                // Rebuilding the list fires row-selected synchronously, so no
                // borrow may be live while the widgets change.
                let (devices, selected) = {
                    let mut state = state.borrow_mut();
                    state.devices = devices;
                    state.devices.sort_by(|a, b| a.name.cmp(&b.name));
                    if let Some(id) = &state.selected {
                        if !state.devices.iter().any(|d| &d.id == id) {
                            state.selected = None;
                        }
                    }
                    (state.devices.clone(), state.selected.clone())
                };
                rebuild_list(&devices, &list);
                // Removing rows deselected everything; restore the kept
                // selection through the row-selected handler.
                let kept = selected
                    .and_then(|id| devices.iter().position(|d| d.id == id))
                    .and_then(|index| list.row_at_index(index as i32));
                match kept {
                    Some(row) => list.select_row(Some(&row)),
                    None => show_selected(None, &view),
                }
            }
        });
    }

    window.present();
    main_loop.run();
    Ok(())
}

fn build_device_view(parent: &gtk::Box) -> DeviceView {
    let container = gtk::Box::new(gtk::Orientation::Horizontal, 10);
    container.set_margin_top(20);
    container.set_margin_start(20);
    container.set_margin_end(20);
    container.set_hexpand(true);
    parent.append(&container);

    let icon = gtk::Image::new();
    icon.set_pixel_size(64);
    container.append(&icon);

    let name_box = gtk::Box::new(gtk::Orientation::Vertical, 5);
    name_box.set_hexpand(true);
    container.append(&name_box);

    let name = gtk::Label::new(None);
    name.set_xalign(0.0);
    name_box.append(&name);

    let status = gtk::Label::new(None);
    status.set_xalign(0.0);
    name_box.append(&status);

    let browse_button = gtk::Button::from_icon_name("document-open-symbolic");
    container.append(&browse_button);

    let pair_button = gtk::Button::new();
    container.append(&pair_button);

    container.set_visible(false);

    DeviceView {
        name,
        status,
        icon,
        pair_button,
        browse_button,
        container,
    }
}

fn rebuild_list(devices: &[Device], list: &gtk::ListBox) {
    while let Some(child) = list.first_child() {
        list.remove(&child);
    }
    for device in devices {
        let label = gtk::Label::new(Some(&device.name));
        label.set_xalign(0.0);
        label.set_margin_top(15);
        label.set_margin_bottom(15);
        label.set_margin_start(20);
        let row = gtk::ListBoxRow::new();
        row.set_child(Some(&label));
        list.append(&row);
    }
}

fn show_selected(device: Option<&Device>, view: &DeviceView) {
    let Some(device) = device else {
        view.container.set_visible(false);
        return;
    };

    view.container.set_visible(true);
    view.name
        .set_markup(&format!("<big>{}</big>", glib::markup_escape_text(&device.name)));
    view.icon.set_icon_name(Some(device.icon_name()));
    view.browse_button.set_visible(device.paired);

    if device.paired {
        view.status.set_text("Device connected");
        view.pair_button.set_label("Unpair");
    } else {
        view.status.set_text("Device available");
        view.pair_button.set_label("Pair");
    }
}
