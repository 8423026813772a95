//! Project / continuous query / window graph, as returned by the `model`
//! request.

use espconnect_protocol::{ProtocolError, Schema, XmlElement};
use std::collections::HashMap;
use std::fmt;

/// Broad category of a window type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowClass {
    Input,
    Transformation,
    Utility,
    Analytics,
    TextAnalytics,
    Unknown,
}

impl WindowClass {
    pub fn for_type(window_type: &str) -> WindowClass {
        match window_type {
            "source" => WindowClass::Input,
            "filter" | "aggregate" | "compute" | "union" | "join" | "copy" | "functional" => {
                WindowClass::Transformation
            }
            "notification" | "pattern" | "counter" | "geofence" | "procedural" => {
                WindowClass::Utility
            }
            "model-supervisor" | "model-reader" | "train" | "calculate" | "score" => {
                WindowClass::Analytics
            }
            t if t.starts_with("text-") => WindowClass::TextAnalytics,
            _ => WindowClass::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowClass::Input => "input",
            WindowClass::Transformation => "transformation",
            WindowClass::Utility => "utility",
            WindowClass::Analytics => "analytics",
            WindowClass::TextAnalytics => "textanalytics",
            WindowClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for WindowClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index used when neither the window nor its parents name one.
pub const DEFAULT_INDEX: &str = "pi_HASH";

#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub project: String,
    pub contquery: String,
    pub name: String,
    /// `project/contquery/window`
    pub key: String,
    /// Type without the `window-` element prefix, e.g. `source`.
    pub window_type: String,
    pub class: WindowClass,
    pub index: String,
    pub pubsub: bool,
    pub read: bool,
    pub write: bool,
    pub schema: Schema,
    /// Keys of upstream windows.
    pub incoming: Vec<String>,
    /// Keys of downstream windows.
    pub outgoing: Vec<String>,
}

impl Window {
    pub fn is_source(&self) -> bool {
        self.window_type == "source"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContQuery {
    pub name: String,
    /// `project/contquery`
    pub key: String,
    pub index: Option<String>,
    pub read: bool,
    pub write: bool,
    /// Window keys, sorted by window name.
    pub windows: Vec<String>,
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub name: String,
    pub index: Option<String>,
    pub read: bool,
    pub write: bool,
    pub contqueries: Vec<ContQuery>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Model {
    projects: Vec<Project>,
    windows: Vec<Window>,
    by_key: HashMap<String, usize>,
}

impl Model {
    pub fn parse(xml: &str) -> Result<Model, ProtocolError> {
        Ok(Self::from_xml(&XmlElement::parse(xml)?))
    }

    /// Builds the model from any document containing `project` elements.
    pub fn from_xml(root: &XmlElement) -> Model {
        let mut model = Model::default();

        for p in root.find_all("//project") {
            let name = p.attr("name").unwrap_or("").to_string();
            let mut project = Project {
                name: name.clone(),
                index: non_empty(p.attr("index")),
                read: permission(p.attr("read")),
                write: permission(p.attr("write")),
                contqueries: Vec::new(),
            };

            for c in p.find_all(".//contquery") {
                let cq_name = c.attr("name").unwrap_or("").to_string();
                let mut contquery = ContQuery {
                    key: format!("{}/{}", name, cq_name),
                    name: cq_name,
                    index: non_empty(c.attr("index")),
                    read: permission(c.attr("read")),
                    write: permission(c.attr("write")),
                    windows: Vec::new(),
                    edges: Vec::new(),
                };

                let mut elements = c.find_all(".//window");
                if elements.is_empty() {
                    elements = c.find_all(".//windows/*");
                }
                for w in elements {
                    let window = model.window_from_xml(&project, &contquery, w);
                    contquery.windows.push(window.key.clone());
                    model.insert(window);
                }

                model.link_edges(&mut contquery, c);

                let windows = &model.windows;
                let by_key = &model.by_key;
                contquery
                    .windows
                    .sort_by(|a, b| name_of(windows, by_key, a).cmp(name_of(windows, by_key, b)));
                project.contqueries.push(contquery);
            }

            model.projects.push(project);
        }

        model
    }

    fn window_from_xml(&self, project: &Project, contquery: &ContQuery, w: &XmlElement) -> Window {
        let name = w.attr("name").unwrap_or("").to_string();
        let raw_type = w
            .attr("type")
            .filter(|t| !t.is_empty())
            .unwrap_or(w.name.as_str());
        let window_type = raw_type.strip_prefix("window-").unwrap_or(raw_type).to_string();
        let index = non_empty(w.attr("index"))
            .or_else(|| contquery.index.clone())
            .or_else(|| project.index.clone())
            .unwrap_or_else(|| DEFAULT_INDEX.to_string());

        Window {
            project: project.name.clone(),
            contquery: contquery.name.clone(),
            key: format!("{}/{}", contquery.key, name),
            name,
            class: WindowClass::for_type(&window_type),
            window_type,
            index,
            pubsub: w.attr("pubsub") == Some("true"),
            read: permission(w.attr("read")),
            write: permission(w.attr("write")),
            schema: Schema::from_xml(w),
            incoming: Vec::new(),
            outgoing: Vec::new(),
        }
    }

    fn insert(&mut self, window: Window) {
        self.by_key.insert(window.key.clone(), self.windows.len());
        self.windows.push(window);
    }

    /// Resolves `edges/edge` elements; `source` and `target` hold
    /// space-separated window names. Unknown names are skipped.
    fn link_edges(&mut self, contquery: &mut ContQuery, element: &XmlElement) {
        for edge in element.find_all("./edges/edge") {
            let targets: Vec<String> = edge
                .attr("target")
                .unwrap_or("")
                .split_whitespace()
                .map(|t| format!("{}/{}", contquery.key, t))
                .filter(|k| self.by_key.contains_key(k))
                .collect();

            for source in edge.attr("source").unwrap_or("").split_whitespace() {
                let from = format!("{}/{}", contquery.key, source);
                let Some(&a) = self.by_key.get(&from) else {
                    continue;
                };
                for to in &targets {
                    let Some(&z) = self.by_key.get(to) else {
                        continue;
                    };
                    self.windows[a].outgoing.push(to.clone());
                    self.windows[z].incoming.push(from.clone());
                    contquery.edges.push(Edge {
                        from: from.clone(),
                        to: to.clone(),
                    });
                }
            }
        }
    }

    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    pub fn project(&self, name: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.name == name)
    }

    pub fn contqueries(&self) -> impl Iterator<Item = &ContQuery> {
        self.projects.iter().flat_map(|p| p.contqueries.iter())
    }

    pub fn contquery(&self, key: &str) -> Option<&ContQuery> {
        self.contqueries().find(|c| c.key == key)
    }

    /// All windows in document order.
    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    pub fn window(&self, key: &str) -> Option<&Window> {
        self.by_key.get(key).map(|&i| &self.windows[i])
    }

    pub fn source_windows(&self) -> Vec<&Window> {
        self.windows.iter().filter(|w| w.is_source()).collect()
    }

    /// Windows of one project, or of every project for `"*"`.
    pub fn windows_for_project(&self, project: &str) -> Vec<&Window> {
        self.windows
            .iter()
            .filter(|w| project == "*" || w.project == project)
            .collect()
    }

    /// Windows of a continuous query in name order.
    pub fn windows_of(&self, contquery: &ContQuery) -> Vec<&Window> {
        contquery
            .windows
            .iter()
            .filter_map(|k| self.window(k))
            .collect()
    }
}

fn name_of<'a>(windows: &'a [Window], by_key: &HashMap<String, usize>, key: &str) -> &'a str {
    by_key
        .get(key)
        .map(|&i| windows[i].name.as_str())
        .unwrap_or("")
}

/// Permission attributes default to granted.
fn permission(value: Option<&str>) -> bool {
    match value {
        Some(v) if !v.is_empty() => v == "true",
        _ => true,
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}
