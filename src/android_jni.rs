//! JNI bindings for the Android app.
//!
//! Each public function here corresponds to a `external fun` declaration
//! in RustBridge.kt. The function names follow JNI naming conventions:
//! Java_<package>_<class>_<method> with dots replaced by underscores.
//!
//! Results cross the boundary as JSON strings. Failures come back as
//! `{"error": "..."}` so Kotlin never has to catch a Java exception.

use jni::objects::{JByteArray, JClass, JString};
use jni::sys::{jdouble, jstring};
use jni::JNIEnv;
use log::LevelFilter;

use crate::route_nav::{nav_package_from_route, synthesize_steps, PackageSource};
use crate::types::GeoPoint;

const LOG_TAG: &str = "routecoach";

fn java_string(env: &JNIEnv, value: &str) -> jstring {
    env.new_string(value)
        .expect("failed to create Java string")
        .into_raw()
}

fn error_json(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

fn gpx_to_polyline_json(data: &[u8]) -> String {
    crate::gpx::parse_path_to_json(data).unwrap_or_else(|e| error_json(&e))
}

fn local_nav_package_json(polyline_json: &str) -> String {
    let points: Vec<GeoPoint> = match serde_json::from_str(polyline_json) {
        Ok(points) => points,
        Err(e) => return error_json(&format!("invalid polyline JSON: {e}")),
    };
    if points.len() < 2 {
        return error_json("polyline needs at least 2 points");
    }
    let steps = synthesize_steps(&points);
    let pkg = nav_package_from_route(&points, steps, PackageSource::Local);
    serde_json::to_string(&pkg).unwrap_or_else(|e| error_json(&format!("JSON serialize error: {e}")))
}

/// Returns the core library version.
/// Maps to: RustBridge.version() -> String
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_routecoach_app_RustBridge_version(
    env: JNIEnv,
    _class: JClass,
) -> jstring {
    java_string(&env, crate::VERSION)
}

/// Routes `log` output to logcat. Safe to call more than once.
/// Maps to: RustBridge.initLogging()
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_routecoach_app_RustBridge_initLogging(
    _env: JNIEnv,
    _class: JClass,
) {
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag(LOG_TAG),
    );
}

/// Maps to: RustBridge.gpxToPolylineJson(data: ByteArray) -> String
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_routecoach_app_RustBridge_gpxToPolylineJson<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    data: JByteArray<'local>,
) -> jstring {
    let json = match env.convert_byte_array(&data) {
        Ok(bytes) => gpx_to_polyline_json(&bytes),
        Err(e) => error_json(&format!("could not read byte array: {e}")),
    };
    java_string(&env, &json)
}

/// Builds a package with locally synthesized steps from a JSON
/// coordinate list.
/// Maps to: RustBridge.localNavPackageJson(polylineJson: String) -> String
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_routecoach_app_RustBridge_localNavPackageJson<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    polyline_json: JString<'local>,
) -> jstring {
    let json = match env.get_string(&polyline_json) {
        Ok(input) => local_nav_package_json(&String::from(input)),
        Err(e) => error_json(&format!("could not read string: {e}")),
    };
    java_string(&env, &json)
}

/// Maps to: RustBridge.formatDistanceVoice(meters: Double) -> String
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_routecoach_app_RustBridge_formatDistanceVoice(
    env: JNIEnv,
    _class: JClass,
    meters: jdouble,
) -> jstring {
    java_string(&env, &crate::units::format_distance_voice_uk(meters))
}
