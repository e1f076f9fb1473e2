//! Native command handlers.
//!
//! Commands that run against the device rather than a secondary driver.
//! Handlers are grouped by what the session must support for them:
//! [`TouchCapable`], [`ContextSwitchable`] and [`EmulatorControllable`],
//! plus the element and page methods on [`Session`] itself.

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use tracing::debug;

use crate::command::Settings;
use crate::context::available_contexts;
use crate::element::{find_all, parse_hierarchy, LocatorStrategy, UiNode};
use crate::error::DriverError;
use crate::gesture::{DragPoint, GestureAction, GestureComposer, GestureReport, Target};
use crate::journal::SessionEvent;
use crate::session::Session;

/// Sessions that can inject touch gestures.
#[async_trait]
pub trait TouchCapable {
    /// Performs one ordered action sequence.
    async fn perform_touch(&self, actions: &[GestureAction]) -> Result<GestureReport, DriverError>;

    /// Performs one sequence per finger, interleaved.
    async fn perform_multi_action(
        &self,
        groups: &[Vec<GestureAction>],
    ) -> Result<GestureReport, DriverError>;

    /// Drags from a start point to an end point.
    async fn perform_drag(&self, points: &[DragPoint]) -> Result<GestureReport, DriverError>;
}

/// Sessions that can switch between native and web contexts.
#[async_trait]
pub trait ContextSwitchable {
    /// Names of the contexts currently available.
    async fn contexts(&self) -> Result<Vec<String>, DriverError>;

    /// Name of the active context.
    fn current_context_name(&self) -> String;

    /// Switches to `name`.
    async fn switch_context(&mut self, name: &str) -> Result<(), DriverError>;
}

/// Sessions that can drive emulator-only facilities.
///
/// Every method must call [`ensure_emulator`](Self::ensure_emulator) before
/// doing anything else.
#[async_trait]
pub trait EmulatorControllable {
    /// True when the device is an emulator.
    fn on_emulator(&self) -> bool;

    /// Fails with a method-specific message on real hardware.
    fn ensure_emulator(&self, method: &str) -> Result<(), DriverError> {
        if !self.on_emulator() {
            return Err(DriverError::UnsupportedOperation(format!(
                "{} method is only available for emulators",
                method
            )));
        }
        Ok(())
    }

    /// Touches the fingerprint sensor with an enrolled finger.
    async fn fingerprint(&self, finger_id: u32) -> Result<(), DriverError>;

    /// Delivers an SMS.
    async fn send_sms(&self, phone_number: &str, message: &str) -> Result<(), DriverError>;

    /// Overrides a sensor value.
    async fn sensor_set(&self, sensor_type: &str, value: &str) -> Result<(), DriverError>;
}

#[async_trait]
impl TouchCapable for Session {
    async fn perform_touch(&self, actions: &[GestureAction]) -> Result<GestureReport, DriverError> {
        let bridge = self.device()?;
        GestureComposer::new(bridge.as_ref())
            .perform_touch(actions, &self.elements)
            .await
    }

    async fn perform_multi_action(
        &self,
        groups: &[Vec<GestureAction>],
    ) -> Result<GestureReport, DriverError> {
        let bridge = self.device()?;
        GestureComposer::new(bridge.as_ref())
            .perform_multi_action(groups, &self.elements)
            .await
    }

    async fn perform_drag(&self, points: &[DragPoint]) -> Result<GestureReport, DriverError> {
        let bridge = self.device()?;
        GestureComposer::new(bridge.as_ref())
            .perform_drag(points, &self.elements)
            .await
    }
}

#[async_trait]
impl ContextSwitchable for Session {
    async fn contexts(&self) -> Result<Vec<String>, DriverError> {
        let bridge = self.device()?;
        let contexts = available_contexts(bridge.as_ref()).await?;
        Ok(contexts.iter().map(|c| c.name()).collect())
    }

    fn current_context_name(&self) -> String {
        self.router.current_context().name()
    }

    async fn switch_context(&mut self, name: &str) -> Result<(), DriverError> {
        self.router.set_context(name, None).await?;
        self.journal().emit(SessionEvent::ContextChanged {
            context: name.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl EmulatorControllable for Session {
    fn on_emulator(&self) -> bool {
        self.is_emulator()
    }

    async fn fingerprint(&self, finger_id: u32) -> Result<(), DriverError> {
        self.ensure_emulator("fingerprint")?;
        self.device()?.fingerprint(finger_id).await?;
        Ok(())
    }

    async fn send_sms(&self, phone_number: &str, message: &str) -> Result<(), DriverError> {
        self.ensure_emulator("sendSMS")?;
        self.device()?.send_sms(phone_number, message).await?;
        Ok(())
    }

    async fn sensor_set(&self, sensor_type: &str, value: &str) -> Result<(), DriverError> {
        self.ensure_emulator("sensorSet")?;
        self.device()?.sensor_set(sensor_type, value).await?;
        Ok(())
    }
}

impl Session {
    async fn hierarchy(&self) -> Result<Vec<UiNode>, DriverError> {
        let compressed = self.settings.ignore_unimportant_views.unwrap_or(false);
        let xml = self.device()?.dump_hierarchy(compressed).await?;
        parse_hierarchy(&xml)
    }

    /// Finds every element matching the locator and caches them.
    pub async fn find_elements(
        &mut self,
        strategy: &str,
        selector: &str,
    ) -> Result<Vec<String>, DriverError> {
        let strategy = LocatorStrategy::parse(strategy)?;
        let nodes = self.hierarchy().await?;
        let found = find_all(&nodes, strategy, selector, self.caps.app_package.as_deref());
        debug!(?strategy, selector, count = found.len(), "element lookup");
        Ok(found.into_iter().map(|node| self.elements.insert(node)).collect())
    }

    /// Finds the first element matching the locator.
    pub async fn find_element(&mut self, strategy: &str, selector: &str) -> Result<String, DriverError> {
        self.find_elements(strategy, selector)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                DriverError::NoSuchElement(format!(
                    "An element could not be located on the page using the given search parameters ({} = '{}')",
                    strategy, selector
                ))
            })
    }

    /// Visible text of a cached element; empty when it has none.
    pub fn element_text(&self, element: &str) -> Result<String, DriverError> {
        Ok(self.elements.get(element)?.text.clone().unwrap_or_default())
    }

    /// Top-left corner of a cached element.
    pub fn element_location(&self, element: &str) -> Result<Value, DriverError> {
        let rect = self.elements.rect(element)?;
        Ok(json!({ "x": rect.x, "y": rect.y }))
    }

    /// Size of a cached element.
    pub fn element_size(&self, element: &str) -> Result<Value, DriverError> {
        let rect = self.elements.rect(element)?;
        Ok(json!({ "width": rect.width, "height": rect.height }))
    }

    /// Taps the center of a cached element.
    pub async fn click(&self, element: &str) -> Result<(), DriverError> {
        let target = Target::Element {
            id: element.to_string(),
            offset: None,
        };
        self.perform_touch(&[GestureAction::Tap(target)]).await?;
        Ok(())
    }

    /// Launches `activity` of `package` and waits for it to come up.
    pub async fn start_activity(&self, package: &str, activity: &str) -> Result<(), DriverError> {
        if package.is_empty() || activity.is_empty() {
            return Err(DriverError::InvalidArgument(
                "startActivity needs both a package and an activity".to_string(),
            ));
        }
        debug!(package, activity, "starting activity");
        self.device()?.start_app(package, Some(activity)).await?;
        Ok(())
    }

    /// The UI hierarchy as XML.
    pub async fn page_source(&self) -> Result<String, DriverError> {
        let compressed = self.settings.ignore_unimportant_views.unwrap_or(false);
        Ok(self.device()?.dump_hierarchy(compressed).await?)
    }

    /// Screen capture as base64 PNG.
    pub async fn screenshot(&self) -> Result<String, DriverError> {
        let png = self.device()?.screenshot().await?;
        Ok(base64::engine::general_purpose::STANDARD.encode(png))
    }

    /// Applies settings; unset fields keep their value.
    pub fn update_settings(&mut self, update: Settings) -> Settings {
        if let Some(ignore) = update.ignore_unimportant_views {
            self.settings.ignore_unimportant_views = Some(ignore);
        }
        self.settings.clone()
    }

    /// Current settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}
