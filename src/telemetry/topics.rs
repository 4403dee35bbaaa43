//! Static tag → topic table

/// Every tag the dispatcher forwards; anything else is dropped silently
pub const KNOWN_TAGS: [&str; 18] = [
    "ig_point",
    "fuel_press",
    "oil_press",
    "l_probe",
    "r_probe",
    "g_probe",
    "air_temp",
    "battery",
    "map",
    "gear",
    "tps",
    "acc",
    "rpm",
    "speed",
    "engine",
    "oil",
    "disk",
    "brake",
];

/// Topic for a lowercased tag, `None` for unknown tags
pub fn topic_for(tag: &str) -> Option<&'static str> {
    let topic = match tag {
        "ig_point" => "ig_point/data",
        "fuel_press" => "fuel_press/data",
        "oil_press" => "oil_press/data",
        "l_probe" => "l_probe/data",
        "r_probe" => "r_probe/data",
        "g_probe" => "g_probe/data",
        "air_temp" => "air_temp/data",
        "battery" => "battery/data",
        "map" => "map/data",
        "gear" => "gear/data",
        "tps" => "tps/data",
        "acc" => "acceleration/data",
        "rpm" => "rpm/data",
        "speed" => "speed/data",
        "engine" => "engine/data",
        "oil" => "oil/data",
        "disk" => "disk/data",
        "brake" => "brake/data",
        _ => return None,
    };
    Some(topic)
}
