use crate::buffer::BufferLabel;
use crate::channel::ChannelState;
use crate::module::Module;
use crate::rundata::DataValue;
use crate::utils::Counter;
use crate::Conf;
use anyhow::Result;
use crossbeam_channel::{tick, unbounded, Receiver, Sender};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use log::{info, warn};
use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::Stylize,
    symbols::border,
    text::{Line, Text},
    widgets::{Block, Paragraph, Widget},
    DefaultTerminal, Frame,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// What the monitor shows for one detector channel.
#[derive(Debug, Clone)]
pub struct ChannelRow {
    pub module: String,
    pub channel: usize,
    pub state: ChannelState,
    pub icr: f64,
    pub ocr: f64,
    pub current_pixel: Option<u32>,
    pub ready: [bool; 2],
    pub overruns: u64,
}

pub struct Status {
    pub modules: Vec<Arc<Module>>,
    pub counter: Counter,
    pub t_begin: Instant,
    pub run_duration: Option<Duration>,
    pub poll_interval: Duration,
    pub buffers: usize,
    /// Receiver traffic summed over modules, MB/s.
    pub card_rate: f64,
    pub rows: Vec<ChannelRow>,
    pub exit: Option<StatusExit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusExit {
    Quit,
    Timeout,
}

impl Status {
    pub fn new(modules: Vec<Arc<Module>>, config: &Conf) -> Self {
        let run_duration = match config.run_settings.run_duration {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let rows = modules
            .iter()
            .flat_map(|m| {
                (0..m.num_channels()).map(move |channel| ChannelRow {
                    module: m.alias().to_string(),
                    channel,
                    state: ChannelState::Ready,
                    icr: 0.0,
                    ocr: 0.0,
                    current_pixel: None,
                    ready: [false; 2],
                    overruns: 0,
                })
            })
            .collect();
        Self {
            modules,
            counter: Counter::default(),
            t_begin: Instant::now(),
            run_duration,
            poll_interval: Duration::from_millis(config.run_settings.poll_interval_ms.max(10)),
            buffers: 0,
            card_rate: 0.0,
            rows,
            exit: None,
        }
    }

    pub fn run(&mut self, terminal: &mut DefaultTerminal) -> Result<StatusExit> {
        let ticker = tick(self.poll_interval);
        self.t_begin = Instant::now();
        self.counter.reset();
        self.exit = None;

        for module in &self.modules {
            module.start_run(None)?;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx_words, rx_words) = unbounded();
        let consumers: Vec<JoinHandle<()>> = self
            .modules
            .iter()
            .map(|module| {
                let module = Arc::clone(module);
                let tx = tx_words.clone();
                let shutdown = Arc::clone(&shutdown);
                let interval = self.poll_interval;
                thread::spawn(move || consume_buffers(module, tx, shutdown, interval))
            })
            .collect();
        drop(tx_words);

        while self.exit.is_none() {
            let _ = ticker.recv();
            self.drain(&rx_words);
            self.refresh();
            self.handle_events()?;
            if let Some(duration) = self.run_duration {
                if self.t_begin.elapsed() >= duration {
                    self.exit = Some(StatusExit::Timeout);
                }
            }
            terminal.draw(|f| self.draw(f))?;
        }

        for module in &self.modules {
            if let Err(err) = module.stop_run(None) {
                warn!("{}: stop failed: {}", module.alias(), err);
            }
        }
        shutdown.store(true, Ordering::SeqCst);
        for handle in consumers {
            if handle.join().is_err() {
                warn!("buffer consumer thread panicked");
            }
        }
        self.drain(&rx_words);
        info!(
            "run {} ended: {} buffers, {} frames of traffic",
            self.run_number(),
            self.buffers,
            self.counter.frames
        );
        Ok(self.exit.unwrap_or(StatusExit::Quit))
    }

    fn run_number(&self) -> u32 {
        self.modules.first().map(|m| m.run_number()).unwrap_or(0)
    }

    fn drain(&mut self, rx: &Receiver<usize>) {
        while let Ok(words) = rx.try_recv() {
            self.counter.increment(4 * words);
            self.buffers += 1;
        }
    }

    /// Re-reads state, rates and buffer flags for every channel.
    fn refresh(&mut self) {
        let mut index = 0;
        self.card_rate = self.modules.iter().map(|m| m.traffic().0).sum();
        for module in &self.modules {
            for channel in 0..module.num_channels() {
                let row = &mut self.rows[index];
                index += 1;
                let value = |name: &str| {
                    module
                        .get_run_data(channel, name, None)
                        .ok()
                        .and_then(|v| v.as_f64())
                };
                row.state = module.channel_state(channel).unwrap_or(ChannelState::Disconnected);
                row.icr = value("input_count_rate").unwrap_or(0.0);
                row.ocr = value("output_count_rate").unwrap_or(0.0);
                row.current_pixel = value("current_pixel").map(|p| p as u32);
                row.ready = [
                    value("buffer_full_a").unwrap_or(0.0) != 0.0,
                    value("buffer_full_b").unwrap_or(0.0) != 0.0,
                ];
                row.overruns = value("buffer_overrun").unwrap_or(0.0) as u64;
            }
        }
    }

    fn draw(&self, frame: &mut Frame) {
        frame.render_widget(self, frame.area());
    }

    fn handle_events(&mut self) -> Result<()> {
        if event::poll(Duration::ZERO)? {
            if let Event::Key(key_event) = event::read()? {
                if key_event.kind == KeyEventKind::Press {
                    self.handle_key_event(key_event);
                }
            }
        }
        Ok(())
    }

    fn handle_key_event(&mut self, key_event: KeyEvent) {
        if let KeyCode::Char('q') = key_event.code {
            self.exit = Some(StatusExit::Quit);
        }
    }
}

/// Hands every completed mapping buffer to the consumer and releases it.
/// Makes one last pass after `shutdown` so the buffer closed by the run stop
/// is collected too.
fn consume_buffers(module: Arc<Module>, tx: Sender<usize>, shutdown: Arc<AtomicBool>, interval: Duration) {
    loop {
        let stopping = shutdown.load(Ordering::SeqCst);
        for channel in 0..module.num_channels() {
            for (label, full, data) in [
                (BufferLabel::A, "buffer_full_a", "buffer_a"),
                (BufferLabel::B, "buffer_full_b", "buffer_b"),
            ] {
                if module.get_run_data(channel, full, None) != Ok(DataValue::Flag(true)) {
                    continue;
                }
                if let Ok(DataValue::Words(words)) = module.get_run_data(channel, data, None) {
                    if tx.send(words.len()).is_err() {
                        return;
                    }
                }
                if let Err(err) = module.get_run_data(channel, "buffer_done", Some(label.as_char())) {
                    warn!("channel {}: releasing buffer {:?} failed: {}", channel, label, err);
                }
            }
        }
        if stopping {
            break;
        }
        thread::sleep(interval);
    }
}

impl Widget for &Status {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let title = Line::from(format!(" Run {} Status ", self.run_number()).bold());
        let instructions = Line::from(vec![" Quit ".into(), "<Q> ".blue().bold()]);
        let block = Block::bordered()
            .title(title.centered())
            .title_bottom(instructions.centered())
            .border_set(border::THICK);

        let mut lines = vec![Line::from(vec![
            "Elapsed time: ".into(),
            self.t_begin.elapsed().as_secs().to_string().yellow(),
            " s".into(),
            " Buffers: ".into(),
            self.buffers.to_string().yellow(),
            " Data rate: ".into(),
            format!("{:.2}", self.counter.rate()).yellow(),
            " MB/s (avg ".into(),
            format!("{:.2}", self.counter.average_rate()).yellow(),
            ") Link: ".into(),
            format!("{:.2}", self.card_rate).yellow(),
            " MB/s".into(),
        ])];
        for row in &self.rows {
            let flag = |ready: bool| if ready { "full" } else { "-" };
            lines.push(Line::from(vec![
                format!("{}[{}] ", row.module, row.channel).bold(),
                row.state.to_string().green(),
                " ICR: ".into(),
                format!("{:.0}", row.icr).yellow(),
                " OCR: ".into(),
                format!("{:.0}", row.ocr).yellow(),
                " Pixel: ".into(),
                row.current_pixel
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".into())
                    .yellow(),
                " A: ".into(),
                flag(row.ready[0]).into(),
                " B: ".into(),
                flag(row.ready[1]).into(),
                " Overruns: ".into(),
                row.overruns.to_string().red(),
            ]));
        }

        Paragraph::new(Text::from(lines))
            .centered()
            .block(block)
            .render(area, buf);
    }
}
