//! The slice of the machine description the controller itself touches:
//! the toolheads and their thermal state. Everything else about the
//! machine (geometry, axes, firmware quirks) stays inside the driver.

/// A position in machine coordinates. All values are millimeters.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Position {
    /// X axis ("left and right").
    pub x: f64,
    /// Y axis ("front to back").
    pub y: f64,
    /// Z axis ("up and down").
    pub z: f64,
}

/// A single toolhead and its thermal state. Temperatures are celsius.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolModel {
    /// Index of the tool on the machine.
    pub index: usize,
    /// Display name of the tool.
    pub name: String,
    /// Last temperature read from the extruder.
    pub extruder_temperature: f64,
    /// Target temperature the extruder is driving toward.
    pub extruder_target: f64,
    /// Last temperature read from the build platform.
    pub platform_temperature: f64,
    /// Target temperature the platform is driving toward.
    pub platform_target: f64,
}

impl ToolModel {
    /// A tool with everything at ambient.
    pub fn new(index: usize, name: &str) -> Self {
        Self {
            index,
            name: name.to_owned(),
            extruder_temperature: 0.0,
            extruder_target: 0.0,
            platform_temperature: 0.0,
            platform_target: 0.0,
        }
    }

    /// Set the extruder target temperature.
    pub fn set_target_temperature(&mut self, celsius: f64) {
        self.extruder_target = celsius;
    }

    /// Set the platform target temperature.
    pub fn set_platform_target_temperature(&mut self, celsius: f64) {
        self.platform_target = celsius;
    }
}

/// The machine description shared between the controller and a driver.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineModel {
    name: String,
    tools: Vec<ToolModel>,
    current_tool: usize,
}

impl MachineModel {
    /// A machine with the given display name and a single default tool.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            tools: vec![ToolModel::new(0, "extruder 0")],
            current_tool: 0,
        }
    }

    /// Display name of the machine.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the display name.
    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_owned();
    }

    /// All tools on the machine.
    pub fn tools(&self) -> &[ToolModel] {
        &self.tools
    }

    /// The currently selected tool.
    pub fn current_tool(&self) -> &ToolModel {
        &self.tools[self.current_tool]
    }

    /// Mutable access to the currently selected tool.
    pub fn current_tool_mut(&mut self) -> &mut ToolModel {
        &mut self.tools[self.current_tool]
    }

    /// Select a tool by index. Out-of-range indices are ignored.
    pub fn select_tool(&mut self, index: usize) {
        if index < self.tools.len() {
            self.current_tool = index;
        }
    }

    /// Add a tool to the machine.
    pub fn add_tool(&mut self, tool: ToolModel) {
        self.tools.push(tool);
    }
}
