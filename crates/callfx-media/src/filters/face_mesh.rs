use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callfx_common::config::Effect;
use callfx_common::Result;
use image::RgbaImage;

use super::{render, Filter};
use crate::draw;
use crate::inference::{FaceMesh, LazyModel, ModelBackend};
use crate::settings::EffectsSnapshot;

/// Green dot on every face mesh point.
pub struct FaceMeshFilter {
    model: LazyModel<Vec<FaceMesh>>,
}

impl FaceMeshFilter {
    pub fn new(backend: Arc<dyn ModelBackend>, timeout: Duration) -> Self {
        Self {
            model: LazyModel::new("face-mesh", timeout, move || backend.face_mesh_detector()),
        }
    }
}

#[async_trait]
impl Filter for FaceMeshFilter {
    fn effect(&self) -> Effect {
        Effect::FaceMesh
    }

    async fn try_apply(
        &self,
        frame: &RgbaImage,
        _snapshot: &EffectsSnapshot,
    ) -> Result<Option<RgbaImage>> {
        let meshes = self.model.infer(frame).await?;
        if meshes.is_empty() {
            return Ok(None);
        }
        render(frame, move |out| {
            let radius = (out.width() as f32 / 360.0).max(1.0);
            for point in meshes.iter().flat_map(|mesh| mesh.points.iter()) {
                draw::fill_circle(out, point.x, point.y, radius, draw::GREEN);
            }
        })
        .await
        .map(Some)
    }

    fn close(&self) {
        self.model.close();
    }
}
