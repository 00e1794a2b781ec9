use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use tokio::{
    net::TcpListener,
    sync::{watch, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use sunrise_common::{
    AlarmEngine, BrightnessController, ControllerStatus, DayOfWeek, DutyDriver, EngineAction,
    Gesture, GestureConfig, GestureInterpreter, InputSampler, PropertyCommand, PropertySnapshot,
    Result, RuntimeConfig, TimeOfDay, WeeklySchedule,
};

use crate::{api, hardware, sync};

const DEFAULT_CONFIG_PATH: &str = "./sunrise.json";

pub type Light = BrightnessController<Box<dyn DutyDriver>>;

/// Shared handle used by the loops, the MQTT sync and the HTTP handlers.
///
/// The engine and the light sit behind separate locks: engine calls only return actions, and
/// hardware writes happen afterwards under the light lock alone.
#[derive(Clone)]
pub struct AppState {
    engine: Arc<Mutex<AlarmEngine>>,
    light: Arc<Mutex<Light>>,
    timezone: Tz,
    properties: Arc<watch::Sender<PropertySnapshot>>,
    shutdown: watch::Receiver<bool>,
}

pub async fn run() -> anyhow::Result<()> {
    let (config, loaded_from) = load_config().await?;
    init_tracing(&config.log_level);
    match &loaded_from {
        Some(path) => info!("config loaded from {}", path.display()),
        None => info!("no config file found, using defaults"),
    }

    let timezone = parse_timezone(&config.timezone);
    let (duty, button) = hardware::open(&config).context("failed to open hardware")?;
    let mut light = BrightnessController::new(duty, config.ramp.gain, config.ramp.floor)
        .context("invalid ramp settings")?;
    light.apply(0.0).context("failed to switch the light off")?;
    let engine = AlarmEngine::new(config.schedule.clone(), config.ramp.wake_up_length());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = AppState::new(engine, light, timezone, shutdown_rx);

    let mut tasks = vec![
        spawn_tick_loop(state.clone()),
        spawn_sampling_loop(state.clone(), button, config.gesture),
    ];

    if config.mqtt.enabled {
        tasks.push(sync::spawn(state.clone(), &config.mqtt));
    } else {
        info!("mqtt disabled");
    }

    if config.rest.enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.rest.port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind http api at {addr}"))?;
        info!("http api listening on http://{addr}");

        let app = api::router(state.clone());
        let shutdown = wait_for_shutdown(state.shutdown_signal());
        tasks.push(tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!("http api stopped: {err}");
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    shutdown_tx.send_replace(true);

    for task in tasks {
        if let Err(err) = task.await {
            warn!("task ended abnormally: {err}");
        }
    }
    Ok(())
}

impl AppState {
    pub fn new(
        engine: AlarmEngine,
        light: Light,
        timezone: Tz,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let snapshot = PropertySnapshot {
            on: engine.light().is_on,
            gain: light.gain(),
            schedule: engine.schedule().clone(),
            wake_up_length: engine.wake_up_length(),
        };
        let (properties, _) = watch::channel(snapshot);

        Self {
            engine: Arc::new(Mutex::new(engine)),
            light: Arc::new(Mutex::new(light)),
            timezone,
            properties: Arc::new(properties),
            shutdown,
        }
    }

    pub fn properties(&self) -> watch::Receiver<PropertySnapshot> {
        self.properties.subscribe()
    }

    pub fn current_properties(&self) -> PropertySnapshot {
        self.properties.borrow().clone()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    pub fn now(&self) -> DateTime<FixedOffset> {
        now_in_timezone(self.timezone)
    }

    pub async fn tick(&self) {
        self.tick_at(self.now()).await;
    }

    pub async fn tick_at(&self, now: DateTime<FixedOffset>) {
        let actions = self.engine.lock().await.tick(now);
        self.apply(actions).await;
    }

    pub async fn set_alarm(&self, day: DayOfWeek, time_of_day: &str) -> Result<()> {
        self.engine.lock().await.set_alarm(day, time_of_day)?;
        self.refresh_properties().await;
        Ok(())
    }

    pub async fn set_alarm_time(&self, day: DayOfWeek, time_of_day: TimeOfDay) {
        self.engine.lock().await.set_alarm_time(day, time_of_day);
        self.refresh_properties().await;
    }

    pub async fn set_alarm_enabled(&self, day: DayOfWeek, enabled: bool) {
        self.engine.lock().await.set_alarm_enabled(day, enabled);
        self.refresh_properties().await;
    }

    pub async fn set_wake_up_length(&self, value: &str) -> Result<()> {
        self.engine.lock().await.set_wake_up_length(value)?;
        self.refresh_properties().await;
        Ok(())
    }

    pub async fn set_wake_up_length_duration(&self, length: chrono::Duration) -> Result<()> {
        self.engine
            .lock()
            .await
            .set_wake_up_length_duration(length)?;
        self.refresh_properties().await;
        Ok(())
    }

    pub async fn set_on(&self, on: bool) {
        self.set_on_at(on, self.now()).await;
    }

    pub async fn set_on_at(&self, on: bool, now: DateTime<FixedOffset>) {
        let actions = self.engine.lock().await.set_on(on, now);
        self.apply(actions).await;
    }

    pub async fn set_brightness_gain(&self, gain: f64) -> Result<()> {
        self.light.lock().await.set_gain(gain)?;
        self.refresh_properties().await;
        Ok(())
    }

    pub async fn set_start_brightness(&self, floor: f64) -> Result<()> {
        self.light.lock().await.set_floor(floor)?;
        Ok(())
    }

    pub async fn register_gesture(&self, gesture: Gesture) {
        self.register_gesture_at(gesture, self.now()).await;
    }

    pub async fn register_gesture_at(&self, gesture: Gesture, now: DateTime<FixedOffset>) {
        let actions = self.engine.lock().await.register_gesture(gesture, now);
        self.apply(actions).await;
    }

    /// Runs a decoded remote command through the matching setter.
    pub async fn apply_command(&self, command: PropertyCommand) -> Result<()> {
        match command {
            PropertyCommand::SetOn(on) => self.set_on(on).await,
            PropertyCommand::SetBrightnessGain(gain) => self.set_brightness_gain(gain).await?,
            PropertyCommand::SetAlarm(day, time) => self.set_alarm_time(day, time).await,
            PropertyCommand::SetAlarmEnabled(day, enabled) => {
                self.set_alarm_enabled(day, enabled).await
            }
            PropertyCommand::SetWakeUpLength(length) => {
                self.set_wake_up_length_duration(length).await?
            }
        }
        Ok(())
    }

    pub async fn schedule(&self) -> WeeklySchedule {
        self.engine.lock().await.schedule().clone()
    }

    pub async fn status(&self) -> ControllerStatus {
        let (light_state, phase, today_alarm, cancelled_until, wake_up_length, schedule) = {
            let engine = self.engine.lock().await;
            (
                engine.light(),
                engine.phase(),
                engine.today_alarm(),
                engine.cancelled_until(),
                engine.wake_up_length(),
                engine.schedule().clone(),
            )
        };
        let (gain, floor) = {
            let light = self.light.lock().await;
            (light.gain(), light.floor())
        };

        ControllerStatus {
            on: light_state.is_on,
            brightness: light_state.brightness,
            gain,
            start_brightness: floor,
            phase: phase.as_str(),
            today_alarm_epoch: today_alarm.map(|at| at.timestamp()),
            cancelled_until_epoch: cancelled_until.map(|at| at.timestamp()),
            wake_up_length_min: wake_up_length.num_minutes(),
            schedule,
            timezone: self.timezone.name().to_string(),
        }
    }

    async fn apply(&self, actions: Vec<EngineAction>) {
        if actions.is_empty() {
            return;
        }

        for action in actions {
            match action {
                EngineAction::SetLevel(level) => {
                    let result = self.light.lock().await.apply(level);
                    if let Err(err) = result {
                        warn!("light update failed: {err}");
                    }
                }
                EngineAction::ArmCooldown { generation, delay } => {
                    self.spawn_cooldown(generation, delay)
                }
                EngineAction::Armed(at) => info!(%at, "alarm armed"),
                EngineAction::RampStarted(at) => info!(%at, "sunrise started"),
                EngineAction::RampFinished => info!("sunrise finished, light on"),
                EngineAction::Snoozed(until) => info!(%until, "alarm snoozed"),
                EngineAction::Cancelled(until) => info!(%until, "alarm cancelled"),
                EngineAction::CooldownExpired => info!("alarm re-armed after cancel"),
                EngineAction::SkippedAlreadyOn(at) => {
                    info!(%at, "light already on, ramp held")
                }
            }
        }

        self.refresh_properties().await;
    }

    /// One-shot timer that re-arms a cancelled alarm. Dropped on shutdown.
    fn spawn_cooldown(&self, generation: u64, delay: Duration) {
        let state = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = wait_for_shutdown(state.shutdown_signal()) => {
                    debug!(generation, "cooldown timer dropped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let actions = state.engine.lock().await.expire_cooldown(generation);
            if actions.is_empty() {
                debug!(generation, "stale cooldown timer");
            }
            state.apply(actions).await;
        });
    }

    async fn refresh_properties(&self) {
        let (on, schedule, wake_up_length) = {
            let engine = self.engine.lock().await;
            (
                engine.light().is_on,
                engine.schedule().clone(),
                engine.wake_up_length(),
            )
        };
        let gain = self.light.lock().await.gain();

        let snapshot = PropertySnapshot {
            on,
            gain,
            schedule,
            wake_up_length,
        };
        self.properties.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}

fn spawn_tick_loop(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let shutdown = wait_for_shutdown(state.shutdown_signal());
        tokio::pin!(shutdown);

        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
            }
            state.tick().await;
        }
        debug!("tick loop stopped");
    })
}

fn spawn_sampling_loop(
    state: AppState,
    mut sampler: Box<dyn InputSampler>,
    config: GestureConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let shutdown = wait_for_shutdown(state.shutdown_signal());
        tokio::pin!(shutdown);

        let mut interpreter = GestureInterpreter::new(config);
        let mut interval = tokio::time::interval(config.sample_period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut readable = true;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
            }

            let pressed = match sampler.is_pressed() {
                Ok(pressed) => {
                    if !readable {
                        info!("button readable again");
                        readable = true;
                    }
                    pressed
                }
                Err(err) => {
                    if readable {
                        warn!("button read failed: {err}");
                        readable = false;
                    }
                    continue;
                }
            };
            let edge = sampler.take_edge();

            if let Some(gesture) = interpreter.sample(pressed, edge, monotonic_ms()) {
                info!(?gesture, "button");
                state.register_gesture(gesture).await;
            }
        }
        debug!("sampling loop stopped");
    })
}

/// Resolves once shutdown is signalled or the signal's sender is gone.
pub async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn load_config() -> anyhow::Result<(RuntimeConfig, Option<PathBuf>)> {
    let path = std::env::var("SUNRISE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let (mut config, loaded_from) = match read_config_file(&path).await? {
        Some(config) => (config, Some(path)),
        None => (RuntimeConfig::default(), None),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok((config, loaded_from))
}

/// `None` when the file does not exist.
async fn read_config_file(path: &Path) -> anyhow::Result<Option<RuntimeConfig>> {
    match tokio::fs::read(path).await {
        Ok(raw) => RuntimeConfig::from_json(&raw)
            .map(Some)
            .with_context(|| format!("invalid config {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read config {}", path.display())),
    }
}

fn apply_env_overrides(config: &mut RuntimeConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("MQTT_HOST") {
        config.mqtt.host = host;
    }
    if let Some(port) = var("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.mqtt.port = port;
    }
    if let Some(user) = var("MQTT_USER") {
        config.mqtt.user = user;
    }
    if let Some(pass) = var("MQTT_PASS") {
        config.mqtt.pass = pass;
    }
    if let Some(port) = var("SUNRISE_HTTP_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.rest.port = port;
    }
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_timezone(name: &str) -> Tz {
    name.parse::<Tz>().unwrap_or_else(|err| {
        warn!("unknown timezone {name:?} ({err}), falling back to UTC");
        Tz::UTC
    })
}

fn now_in_timezone(timezone: Tz) -> DateTime<FixedOffset> {
    let local = Utc::now().with_timezone(&timezone);
    local.with_timezone(&local.offset().fix())
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
