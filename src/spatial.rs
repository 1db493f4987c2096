//! Spatial reference frame of the listener
//!
//! The listener is owned by the context and shared by all handles, edits are visible to every
//! clone right away.

use std::f32::consts::PI;
use std::sync::Arc;

use parking_lot::Mutex;
use vecmath::{
    vec3_cross, vec3_dot, vec3_len, vec3_normalized, vec3_scale, vec3_square_len, vec3_sub,
    Vector3,
};

use crate::Error;

#[derive(Debug, Clone, Copy)]
struct ListenerFrame {
    position: Vector3<f32>,
    forward: Vector3<f32>,
    up: Vector3<f32>,
}

impl Default for ListenerFrame {
    fn default() -> Self {
        Self {
            position: [0., 0., 0.],
            forward: [0., 0., -1.],
            up: [0., 1., 0.],
        }
    }
}

/// Represents the position and orientation of the person listening to the audio scene
///
/// Obtained via [`BaseAudioContext::listener`](crate::context::BaseAudioContext::listener).
///
/// ```
/// use web_audio_graph::context::{BaseAudioContext, OfflineAudioContext};
///
/// let context = OfflineAudioContext::new(2, 128, 48000.).unwrap();
/// let listener = context.listener();
/// listener.set_position([0., 0., 0.]).unwrap();
///
/// // right in front of the listener
/// let (azimuth, elevation) = listener.azimuth_and_elevation([0., 0., -5.]);
/// assert!(azimuth.abs() < 1e-3);
/// assert!(elevation.abs() < 1e-3);
/// assert!((listener.distance([0., 0., -5.]) - 5.).abs() < 1e-6);
/// ```
#[derive(Debug, Clone, Default)]
pub struct AudioListener {
    frame: Arc<Mutex<ListenerFrame>>,
}

fn validate_vector(name: &str, v: Vector3<f32>) -> Result<(), Error> {
    if v.iter().all(|c| c.is_finite()) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "{} must have finite coordinates, received {:?}",
            name, v
        )))
    }
}

impl AudioListener {
    pub fn position(&self) -> Vector3<f32> {
        self.frame.lock().position
    }

    pub fn forward(&self) -> Vector3<f32> {
        self.frame.lock().forward
    }

    pub fn up(&self) -> Vector3<f32> {
        self.frame.lock().up
    }

    /// Move the listener
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for non-finite coordinates
    pub fn set_position(&self, position: Vector3<f32>) -> Result<(), Error> {
        validate_vector("position", position)?;
        self.frame.lock().position = position;
        Ok(())
    }

    /// Rotate the listener
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for non-finite coordinates
    pub fn set_orientation(&self, forward: Vector3<f32>, up: Vector3<f32>) -> Result<(), Error> {
        validate_vector("forward", forward)?;
        validate_vector("up", up)?;
        let mut frame = self.frame.lock();
        frame.forward = forward;
        frame.up = up;
        Ok(())
    }

    /// Azimuth and elevation in degrees of a source, relative to the listener
    ///
    /// Azimuth is zero straight ahead and positive to the right.
    pub fn azimuth_and_elevation(&self, source: Vector3<f32>) -> (f32, f32) {
        let frame = *self.frame.lock();
        azimuth_and_elevation(source, frame.position, frame.forward, frame.up)
    }

    /// Euclidean distance between a source and the listener
    pub fn distance(&self, source: Vector3<f32>) -> f32 {
        vec3_len(vec3_sub(source, self.position()))
    }
}

fn azimuth_and_elevation(
    source_position: Vector3<f32>,
    listener_position: Vector3<f32>,
    listener_forward: Vector3<f32>,
    listener_up: Vector3<f32>,
) -> (f32, f32) {
    let relative = vec3_sub(source_position, listener_position);

    // source and listener at the same point
    if vec3_square_len(relative) <= f32::MIN_POSITIVE {
        return (0., 0.);
    }
    let direction = vec3_normalized(relative);

    let right = vec3_cross(listener_forward, listener_up);
    // forward and up are linearly dependent, no right vector
    if vec3_square_len(right) == 0. {
        return (0., 0.);
    }
    let right = vec3_normalized(right);
    let forward = vec3_normalized(listener_forward);
    let up = vec3_cross(right, forward);

    let up_projection = vec3_dot(direction, up);
    let elevation = (90. - 180. * up_projection.clamp(-1., 1.).acos() / PI).clamp(-90., 90.);

    let horizontal = vec3_sub(direction, vec3_scale(up, up_projection));
    // straight above or below
    if vec3_square_len(horizontal) == 0. {
        return (0., elevation);
    }
    let horizontal = vec3_normalized(horizontal);

    let mut azimuth = 180. * vec3_dot(horizontal, right).clamp(-1., 1.).acos() / PI;
    if vec3_dot(horizontal, forward) < 0. {
        azimuth = 360. - azimuth;
    }

    // relative to forward instead of right
    #[allow(clippy::manual_range_contains)]
    let azimuth = if azimuth >= 0. && azimuth <= 270. {
        90. - azimuth
    } else {
        450. - azimuth
    };

    (azimuth, elevation)
}
