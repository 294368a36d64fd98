//! Known HAP service and characteristic types.
//!
//! Accessories report types either as a full UUID or as the short form
//! (the first UUID segment with leading zeros stripped, e.g. `"43"`).
//! Everything is canonicalized to the upper-case long form before lookup.

/// Suffix shared by every Apple-defined HAP type.
const HAP_BASE_SUFFIX: &str = "-0000-1000-8000-0026BB765291";

pub const ACCESSORY_INFORMATION: &str = "0000003E-0000-1000-8000-0026BB765291";
pub const NAME: &str = "00000023-0000-1000-8000-0026BB765291";

static SERVICES: &[(&str, &str)] = &[
    ("0000003E-0000-1000-8000-0026BB765291", "AccessoryInformation"),
    ("000000BB-0000-1000-8000-0026BB765291", "AirPurifier"),
    ("0000008D-0000-1000-8000-0026BB765291", "AirQualitySensor"),
    ("00000096-0000-1000-8000-0026BB765291", "BatteryService"),
    ("00000097-0000-1000-8000-0026BB765291", "CarbonDioxideSensor"),
    ("0000007F-0000-1000-8000-0026BB765291", "CarbonMonoxideSensor"),
    ("00000080-0000-1000-8000-0026BB765291", "ContactSensor"),
    ("00000081-0000-1000-8000-0026BB765291", "Door"),
    ("00000121-0000-1000-8000-0026BB765291", "Doorbell"),
    ("00000040-0000-1000-8000-0026BB765291", "Fan"),
    ("000000B7-0000-1000-8000-0026BB765291", "Fanv2"),
    ("000000D7-0000-1000-8000-0026BB765291", "Faucet"),
    ("000000BA-0000-1000-8000-0026BB765291", "FilterMaintenance"),
    ("00000041-0000-1000-8000-0026BB765291", "GarageDoorOpener"),
    ("000000BC-0000-1000-8000-0026BB765291", "HeaterCooler"),
    ("000000BD-0000-1000-8000-0026BB765291", "HumidifierDehumidifier"),
    ("00000082-0000-1000-8000-0026BB765291", "HumiditySensor"),
    ("000000D9-0000-1000-8000-0026BB765291", "InputSource"),
    ("000000CF-0000-1000-8000-0026BB765291", "IrrigationSystem"),
    ("00000083-0000-1000-8000-0026BB765291", "LeakSensor"),
    ("00000084-0000-1000-8000-0026BB765291", "LightSensor"),
    ("00000043-0000-1000-8000-0026BB765291", "Lightbulb"),
    ("00000044-0000-1000-8000-0026BB765291", "LockManagement"),
    ("00000045-0000-1000-8000-0026BB765291", "LockMechanism"),
    ("00000112-0000-1000-8000-0026BB765291", "Microphone"),
    ("00000085-0000-1000-8000-0026BB765291", "MotionSensor"),
    ("00000086-0000-1000-8000-0026BB765291", "OccupancySensor"),
    ("00000047-0000-1000-8000-0026BB765291", "Outlet"),
    ("000000A2-0000-1000-8000-0026BB765291", "ProtocolInformation"),
    ("0000007E-0000-1000-8000-0026BB765291", "SecuritySystem"),
    ("000000CC-0000-1000-8000-0026BB765291", "ServiceLabel"),
    ("000000B9-0000-1000-8000-0026BB765291", "Slat"),
    ("00000087-0000-1000-8000-0026BB765291", "SmokeSensor"),
    ("00000113-0000-1000-8000-0026BB765291", "Speaker"),
    ("00000089-0000-1000-8000-0026BB765291", "StatelessProgrammableSwitch"),
    ("00000049-0000-1000-8000-0026BB765291", "Switch"),
    ("000000D8-0000-1000-8000-0026BB765291", "Television"),
    ("0000008A-0000-1000-8000-0026BB765291", "TemperatureSensor"),
    ("0000004A-0000-1000-8000-0026BB765291", "Thermostat"),
    ("000000D0-0000-1000-8000-0026BB765291", "Valve"),
    ("0000008B-0000-1000-8000-0026BB765291", "Window"),
    ("0000008C-0000-1000-8000-0026BB765291", "WindowCovering"),
];

static CHARACTERISTICS: &[(&str, &str)] = &[
    ("000000B0-0000-1000-8000-0026BB765291", "Active"),
    ("00000001-0000-1000-8000-0026BB765291", "AdministratorOnlyAccess"),
    ("00000095-0000-1000-8000-0026BB765291", "AirQuality"),
    ("00000005-0000-1000-8000-0026BB765291", "AudioFeedback"),
    ("00000068-0000-1000-8000-0026BB765291", "BatteryLevel"),
    ("00000008-0000-1000-8000-0026BB765291", "Brightness"),
    ("00000092-0000-1000-8000-0026BB765291", "CarbonDioxideLevel"),
    ("00000069-0000-1000-8000-0026BB765291", "CarbonMonoxideDetected"),
    ("0000008F-0000-1000-8000-0026BB765291", "ChargingState"),
    ("000000CE-0000-1000-8000-0026BB765291", "ColorTemperature"),
    ("000000E3-0000-1000-8000-0026BB765291", "ConfiguredName"),
    ("0000006A-0000-1000-8000-0026BB765291", "ContactSensorState"),
    ("0000000D-0000-1000-8000-0026BB765291", "CoolingThresholdTemperature"),
    ("0000006B-0000-1000-8000-0026BB765291", "CurrentAmbientLightLevel"),
    ("0000000E-0000-1000-8000-0026BB765291", "CurrentDoorState"),
    ("0000000F-0000-1000-8000-0026BB765291", "CurrentHeatingCoolingState"),
    ("0000006D-0000-1000-8000-0026BB765291", "CurrentPosition"),
    ("00000010-0000-1000-8000-0026BB765291", "CurrentRelativeHumidity"),
    ("00000011-0000-1000-8000-0026BB765291", "CurrentTemperature"),
    ("00000052-0000-1000-8000-0026BB765291", "FirmwareRevision"),
    ("00000053-0000-1000-8000-0026BB765291", "HardwareRevision"),
    ("00000012-0000-1000-8000-0026BB765291", "HeatingThresholdTemperature"),
    ("00000013-0000-1000-8000-0026BB765291", "Hue"),
    ("00000014-0000-1000-8000-0026BB765291", "Identify"),
    ("00000070-0000-1000-8000-0026BB765291", "LeakDetected"),
    ("0000001D-0000-1000-8000-0026BB765291", "LockCurrentState"),
    ("0000001E-0000-1000-8000-0026BB765291", "LockTargetState"),
    ("00000020-0000-1000-8000-0026BB765291", "Manufacturer"),
    ("00000021-0000-1000-8000-0026BB765291", "Model"),
    ("00000022-0000-1000-8000-0026BB765291", "MotionDetected"),
    ("0000011A-0000-1000-8000-0026BB765291", "Mute"),
    ("00000023-0000-1000-8000-0026BB765291", "Name"),
    ("00000024-0000-1000-8000-0026BB765291", "ObstructionDetected"),
    ("00000071-0000-1000-8000-0026BB765291", "OccupancyDetected"),
    ("00000025-0000-1000-8000-0026BB765291", "On"),
    ("00000026-0000-1000-8000-0026BB765291", "OutletInUse"),
    ("00000072-0000-1000-8000-0026BB765291", "PositionState"),
    ("00000073-0000-1000-8000-0026BB765291", "ProgrammableSwitchEvent"),
    ("00000028-0000-1000-8000-0026BB765291", "RotationDirection"),
    ("00000029-0000-1000-8000-0026BB765291", "RotationSpeed"),
    ("0000002F-0000-1000-8000-0026BB765291", "Saturation"),
    ("00000030-0000-1000-8000-0026BB765291", "SerialNumber"),
    ("00000076-0000-1000-8000-0026BB765291", "SmokeDetected"),
    ("00000075-0000-1000-8000-0026BB765291", "StatusActive"),
    ("00000077-0000-1000-8000-0026BB765291", "StatusFault"),
    ("00000079-0000-1000-8000-0026BB765291", "StatusLowBattery"),
    ("00000032-0000-1000-8000-0026BB765291", "TargetDoorState"),
    ("00000033-0000-1000-8000-0026BB765291", "TargetHeatingCoolingState"),
    ("0000007C-0000-1000-8000-0026BB765291", "TargetPosition"),
    ("00000035-0000-1000-8000-0026BB765291", "TargetTemperature"),
    ("00000036-0000-1000-8000-0026BB765291", "TemperatureDisplayUnits"),
    ("00000037-0000-1000-8000-0026BB765291", "Version"),
    ("00000119-0000-1000-8000-0026BB765291", "Volume"),
];

/// Expand a short-form type to its long form and upper-case it.
/// Values that are not short-form hex are returned upper-cased unchanged.
pub fn canonicalize(type_id: &str) -> String {
    let type_id = type_id.trim();
    let is_short = !type_id.is_empty()
        && type_id.len() <= 8
        && type_id.chars().all(|c| c.is_ascii_hexdigit());

    if is_short {
        format!("{:0>8}{}", type_id.to_ascii_uppercase(), HAP_BASE_SUFFIX)
    } else {
        type_id.to_ascii_uppercase()
    }
}

fn lookup(table: &'static [(&'static str, &'static str)], type_id: &str) -> Option<&'static str> {
    let canonical = canonicalize(type_id);
    table
        .iter()
        .find(|(uuid, _)| *uuid == canonical)
        .map(|(_, name)| *name)
}

/// Catalog name of a service type, e.g. `"Lightbulb"`.
pub fn service_name(type_id: &str) -> Option<&'static str> {
    lookup(SERVICES, type_id)
}

/// Catalog name of a characteristic type, e.g. `"CurrentTemperature"`.
pub fn characteristic_name(type_id: &str) -> Option<&'static str> {
    lookup(CHARACTERISTICS, type_id)
}

/// `"CurrentTemperature"` -> `"Current Temperature"`. Digits do not start a new word.
pub fn humanize(name: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut prev: Option<char> = None;

    for c in name.chars() {
        if c == '_' || c == ' ' || c == '-' {
            prev = None;
            continue;
        }
        let boundary = match prev {
            None => true,
            Some(p) => c.is_ascii_uppercase() && (p.is_ascii_lowercase() || p.is_ascii_digit()),
        };
        if boundary {
            words.push(String::new());
        }
        if let Some(word) = words.last_mut() {
            word.push(c);
        }
        prev = Some(c);
    }

    words
        .iter()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}
